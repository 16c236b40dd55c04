//! Configuration for ledger-sync.
//!
//! Loaded from a TOML file with CLI argument overrides. The loaded value is
//! immutable and passed explicitly to every component.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ledger_common::{AccountType, WriteMode};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::binance::{BinanceConfig, DEFAULT_FUTURES_URL, DEFAULT_SPOT_URL};
use crate::notify::TelegramConfig;
use crate::rate::RateLimitConfig;
use crate::reconcile::ReconcileConfig;
use crate::reconcile::klines::KlinesConfig;

/// A reconcilable stream, or one of the market-data jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Balances,
    Trades,
    Orders,
    OpenOrders,
    Deposits,
    Withdrawals,
    Snapshots,
    Prices,
    Klines,
    Ticker,
}

impl Stream {
    /// Per-account streams in the order they run.
    pub const ACCOUNT_STREAMS: [Stream; 7] = [
        Stream::Balances,
        Stream::Trades,
        Stream::Orders,
        Stream::OpenOrders,
        Stream::Deposits,
        Stream::Withdrawals,
        Stream::Snapshots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Balances => "balances",
            Stream::Trades => "trades",
            Stream::Orders => "orders",
            Stream::OpenOrders => "open_orders",
            Stream::Deposits => "deposits",
            Stream::Withdrawals => "withdrawals",
            Stream::Snapshots => "snapshots",
            Stream::Prices => "prices",
            Stream::Klines => "klines",
            Stream::Ticker => "ticker",
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stream {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_lowercase().as_str() {
            "balances" => Stream::Balances,
            "trades" => Stream::Trades,
            "orders" => Stream::Orders,
            "open_orders" | "openorders" => Stream::OpenOrders,
            "deposits" => Stream::Deposits,
            "withdrawals" => Stream::Withdrawals,
            "snapshots" | "daily_account_snapshots" => Stream::Snapshots,
            "prices" => Stream::Prices,
            "klines" => Stream::Klines,
            "ticker" => Stream::Ticker,
            other => bail!("Unknown stream: {other}"),
        })
    }
}

/// Which streams run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModuleFlags {
    pub balances: bool,
    pub daily_account_snapshots: bool,
    pub trades: bool,
    pub orders: bool,
    pub open_orders: bool,
    pub deposits: bool,
    pub withdrawals: bool,
    pub ticker: bool,
    pub prices: bool,
    pub klines: bool,
}

impl Default for ModuleFlags {
    fn default() -> Self {
        Self {
            balances: true,
            daily_account_snapshots: true,
            trades: true,
            orders: true,
            open_orders: true,
            deposits: true,
            withdrawals: true,
            ticker: false,
            prices: true,
            klines: false,
        }
    }
}

impl ModuleFlags {
    pub fn is_enabled(&self, stream: Stream) -> bool {
        match stream {
            Stream::Balances => self.balances,
            Stream::Trades => self.trades,
            Stream::Orders => self.orders,
            Stream::OpenOrders => self.open_orders,
            Stream::Deposits => self.deposits,
            Stream::Withdrawals => self.withdrawals,
            Stream::Snapshots => self.daily_account_snapshots,
            Stream::Prices => self.prices,
            Stream::Klines => self.klines,
            Stream::Ticker => self.ticker,
        }
    }

    /// Enables exactly the given streams.
    pub fn only(streams: &[Stream]) -> Self {
        Self {
            balances: streams.contains(&Stream::Balances),
            daily_account_snapshots: streams.contains(&Stream::Snapshots),
            trades: streams.contains(&Stream::Trades),
            orders: streams.contains(&Stream::Orders),
            open_orders: streams.contains(&Stream::OpenOrders),
            deposits: streams.contains(&Stream::Deposits),
            withdrawals: streams.contains(&Stream::Withdrawals),
            ticker: streams.contains(&Stream::Ticker),
            prices: streams.contains(&Stream::Prices),
            klines: streams.contains(&Stream::Klines),
        }
    }
}

/// One exchange account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    /// Directory under `data_dir` holding this account's ledgers.
    pub dir: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Environment variable holding the API secret.
    pub api_secret_env: String,
    #[serde(default)]
    pub chat_pseudo: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    /// Capital put into the account, for profit reporting.
    #[serde(default)]
    pub investment: Decimal,
}

/// Accounts reported together in one ticker line.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountGroup {
    pub name: String,
    pub chat_id: String,
    pub chat_pseudo: String,
    pub members: Vec<String>,
}

/// Top-level configuration for ledger-sync.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    /// Patterns a symbol must contain to be reconciled for trades and orders.
    pub trade_pair_patterns: Vec<String>,
    pub modules: ModuleFlags,
    pub accounts: Vec<AccountConfig>,
    pub account_groups: Vec<AccountGroup>,
    pub telegram: TelegramConfig,
    pub klines: KlinesConfig,
    pub reconcile: ReconcileConfig,
    pub rate_limit: RateLimitConfig,
    pub binance: BinanceConfig,
}

impl SyncConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        let config = Self::from(file);
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, data_dir: Option<PathBuf>, only: Option<Vec<Stream>>) {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        if let Some(streams) = only
            && !streams.is_empty()
        {
            self.modules = ModuleFlags::only(&streams);
        }
    }

    /// Directory holding candle ledgers.
    pub fn klines_dir(&self) -> PathBuf {
        self.data_dir.join(&self.klines.dir)
    }

    fn validate(&self) -> Result<()> {
        for (i, account) in self.accounts.iter().enumerate() {
            if account.name.is_empty() {
                bail!("Account #{} has no name", i + 1);
            }
            if self.accounts[..i].iter().any(|a| a.name == account.name) {
                bail!("Duplicate account name: {}", account.name);
            }
        }
        for group in &self.account_groups {
            for member in &group.members {
                if !self.accounts.iter().any(|a| &a.name == member) {
                    bail!("Account group {} references unknown account {}", group.name, member);
                }
            }
        }
        if !(self.rate_limit.threshold > 0.0 && self.rate_limit.threshold <= 1.0) {
            bail!("rate_limit.threshold must be in (0, 1], got {}", self.rate_limit.threshold);
        }
        if self.reconcile.snapshot_days_per_request < 1 || self.reconcile.snapshot_max_days < 1 {
            bail!("snapshots.max_days and snapshots.days_per_request must be positive");
        }
        Ok(())
    }
}

// =============================================================================
// TOML file layout
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralSection,
    #[serde(default)]
    modules: ModuleFlags,
    #[serde(default)]
    accounts: Vec<AccountConfig>,
    #[serde(default)]
    account_groups: Vec<AccountGroup>,
    #[serde(default)]
    telegram: TelegramConfig,
    #[serde(default)]
    klines: KlinesConfig,
    #[serde(default)]
    snapshots: SnapshotsSection,
    #[serde(default)]
    balances: BalancesSection,
    #[serde(default)]
    rate_limit: RateLimitSection,
    #[serde(default)]
    upstream: UpstreamSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralSection {
    data_dir: PathBuf,
    log_level: String,
    log_file: Option<PathBuf>,
    reference_asset: String,
    trade_pair_patterns: Vec<String>,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            log_file: None,
            reference_asset: "USDT".to_string(),
            trade_pair_patterns: vec!["USDT".to_string()],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SnapshotsSection {
    max_days: i64,
    days_per_request: i64,
}

impl Default for SnapshotsSection {
    fn default() -> Self {
        Self {
            max_days: 180,
            days_per_request: 30,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BalancesSection {
    write_mode: WriteMode,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RateLimitSection {
    threshold: f64,
    backoff_unit_secs: u64,
    max_backoff_attempts: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            threshold: defaults.threshold,
            backoff_unit_secs: defaults.backoff_unit.as_secs(),
            max_backoff_attempts: defaults.max_backoff_attempts,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UpstreamSection {
    spot_url: String,
    futures_url: String,
    timeout_secs: u64,
    recv_window_ms: u64,
    pair_delay_ms: u64,
    max_page_retries: u32,
    retry_delay_ms: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            spot_url: DEFAULT_SPOT_URL.to_string(),
            futures_url: DEFAULT_FUTURES_URL.to_string(),
            timeout_secs: 30,
            recv_window_ms: 10_000,
            pair_delay_ms: 1000,
            max_page_retries: 5,
            retry_delay_ms: 1000,
        }
    }
}

impl From<TomlConfig> for SyncConfig {
    fn from(file: TomlConfig) -> Self {
        Self {
            data_dir: file.general.data_dir,
            log_level: file.general.log_level,
            log_file: file.general.log_file,
            trade_pair_patterns: file.general.trade_pair_patterns,
            modules: file.modules,
            accounts: file.accounts,
            account_groups: file.account_groups,
            telegram: file.telegram,
            klines: file.klines,
            reconcile: ReconcileConfig {
                reference_asset: file.general.reference_asset,
                pair_delay: Duration::from_millis(file.upstream.pair_delay_ms),
                max_page_retries: file.upstream.max_page_retries,
                retry_delay: Duration::from_millis(file.upstream.retry_delay_ms),
                snapshot_max_days: file.snapshots.max_days,
                snapshot_days_per_request: file.snapshots.days_per_request,
                balance_write_mode: file.balances.write_mode,
            },
            rate_limit: RateLimitConfig {
                threshold: file.rate_limit.threshold,
                backoff_unit: Duration::from_secs(file.rate_limit.backoff_unit_secs),
                max_backoff_attempts: file.rate_limit.max_backoff_attempts,
            },
            binance: BinanceConfig {
                spot_url: file.upstream.spot_url,
                futures_url: file.upstream.futures_url,
                timeout: Duration::from_secs(file.upstream.timeout_secs),
                recv_window: file.upstream.recv_window_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
[general]
data_dir = "/var/lib/ledger"
reference_asset = "USDT"

[modules]
ticker = true
klines = true

[balances]
write_mode = "append"

[[accounts]]
name = "main"
dir = "spot"
type = "SPOT"
api_key_env = "MAIN_KEY"
api_secret_env = "MAIN_SECRET"
chat_pseudo = "Main"
chat_id = "-100123"
investment = 1500

[[accounts]]
name = "fut"
dir = "futures"
type = "FUTURES"
api_key_env = "FUT_KEY"
api_secret_env = "FUT_SECRET"

[[account_groups]]
name = "all"
chat_id = "-100999"
chat_pseudo = "All"
members = ["main", "fut"]

[klines]
intervals = ["1d", "4h"]

[rate_limit]
threshold = 0.8
backoff_unit_secs = 30

[upstream]
pair_delay_ms = 250
"#;

    #[test]
    fn test_parse_sample() {
        let config = SyncConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/ledger"));
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].investment, dec!(1500));
        assert_eq!(config.accounts[1].account_type, AccountType::Futures);
        assert_eq!(config.accounts[1].chat_id, None);
        assert_eq!(config.reconcile.balance_write_mode, WriteMode::Append);
        assert_eq!(config.reconcile.pair_delay, Duration::from_millis(250));
        assert_eq!(config.rate_limit.backoff_unit, Duration::from_secs(30));
        assert_eq!(config.klines.intervals, vec!["1d".to_string(), "4h".to_string()]);
        assert!(config.modules.is_enabled(Stream::Ticker));
        assert!(config.modules.is_enabled(Stream::Trades));
    }

    #[test]
    fn test_defaults() {
        let config = SyncConfig::from_toml_str("").unwrap();

        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.reconcile.reference_asset, "USDT");
        assert_eq!(config.reconcile.snapshot_max_days, 180);
        assert_eq!(config.reconcile.snapshot_days_per_request, 30);
        assert_eq!(config.rate_limit.threshold, 0.75);
        assert_eq!(config.binance.timeout, Duration::from_secs(30));
        assert_eq!(config.reconcile.balance_write_mode, WriteMode::Overwrite);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_unknown_group_member_rejected() {
        let toml = r#"
[[account_groups]]
name = "g"
chat_id = "1"
chat_pseudo = "G"
members = ["nobody"]
"#;
        assert!(SyncConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(SyncConfig::from_toml_str("[general\ndata_dir = ").is_err());
        assert!(SyncConfig::from_file("/nonexistent/ledger-sync.toml").is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = SyncConfig::from_toml_str(SAMPLE).unwrap();
        config.apply_overrides(Some(PathBuf::from("/tmp/x")), Some(vec![Stream::Deposits]));

        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
        assert!(config.modules.is_enabled(Stream::Deposits));
        assert!(!config.modules.is_enabled(Stream::Balances));
        assert!(!config.modules.is_enabled(Stream::Ticker));
    }

    #[test]
    fn test_stream_from_str() {
        assert_eq!("open_orders".parse::<Stream>().unwrap(), Stream::OpenOrders);
        assert_eq!(" Snapshots ".parse::<Stream>().unwrap(), Stream::Snapshots);
        assert!("margin".parse::<Stream>().is_err());
    }
}
