//! ledger-sync: Incremental Binance account history sync CLI.
//!
//! Brings every configured account's CSV ledgers up to date with the exchange.
//!
//! # Usage
//!
//! Run every enabled stream:
//! ```sh
//! ledger-sync --config ledger-sync.toml
//! ```
//!
//! Run selected streams only:
//! ```sh
//! ledger-sync --config ledger-sync.toml --only trades,deposits
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use ledger_sync::notify::{Notifier, TelegramNotifier};
use ledger_sync::{Aggregator, BinanceFactory, Stream, SyncConfig};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Incremental Binance account history into CSV ledgers.
#[derive(Parser, Debug)]
#[command(name = "ledger-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', env = "LEDGER_SYNC_CONFIG", default_value = "ledger-sync.toml")]
    config: PathBuf,

    /// Override the data directory from the config file
    #[arg(long, env = "LEDGER_SYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Comma-separated list of streams to run instead of the configured modules
    #[arg(long)]
    only: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

/// Parse a comma-separated list of stream names.
fn parse_streams(s: &str) -> Result<Vec<Stream>> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

/// RUST_LOG wins over the CLI flag, which wins over the config file.
fn init_logging(cli_level: Option<&str>, config: Option<&SyncConfig>) -> Result<()> {
    let level = cli_level
        .or(config.map(|c| c.log_level.as_str()))
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match config.and_then(|c| c.log_file.as_ref()) {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            fmt().with_env_filter(filter).with_target(false).init();
        }
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_file(&cli.config)?;
    let only = cli.only.as_deref().map(parse_streams).transpose()?;
    config.apply_overrides(cli.data_dir.clone(), only);
    Ok(config)
}

async fn run(config: SyncConfig) -> Result<()> {
    info!(
        "Syncing {} accounts into {}",
        config.accounts.len(),
        config.data_dir.display()
    );

    let notifier = if config.modules.is_enabled(Stream::Ticker) {
        match TelegramNotifier::from_config(&config.telegram) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                warn!("Ticker disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let factory = BinanceFactory::new(config.binance.clone());
    let mut aggregator = Aggregator::new(&config, &factory);
    if let Some(notifier) = &notifier {
        aggregator = aggregator.with_notifier(notifier as &dyn Notifier);
    }

    let report = aggregator.run().await?;
    info!("Sync complete:\n{}", report);

    if report.failure_count() > 0 {
        warn!("{} partitions failed and will be retried next run", report.failure_count());
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not configured yet.
            let _ = init_logging(cli.log_level.as_deref(), None);
            error!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(cli.log_level.as_deref(), Some(&config)) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("ledger-sync v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Sync failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_streams() {
        let streams = parse_streams("trades, open_orders,,deposits").unwrap();
        assert_eq!(streams, vec![Stream::Trades, Stream::OpenOrders, Stream::Deposits]);
        assert!(parse_streams("trades,margin").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "ledger-sync",
            "--config",
            "/etc/ledger.toml",
            "--only",
            "balances",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/ledger.toml"));
        assert_eq!(cli.only.as_deref(), Some("balances"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
