//! Multi-account run orchestration.
//!
//! A run walks the enabled account streams in a fixed order and, for each
//! stream, every configured account in turn. After a stream has been
//! reconciled for all accounts the per-account ledgers are concatenated into
//! the combined files. Market-data streams (prices, klines) follow.
//!
//! Everything is sequential over one connection at a time.

use std::path::PathBuf;
use std::sync::Arc;

use ledger_common::merge_files;
use ledger_common::time::now_ms;
use tracing::{error, info, warn};

use crate::binance::{BinanceClient, BinanceConfig, Credentials, Exchange, UpstreamError};
use crate::config::{AccountConfig, Stream, SyncConfig};
use crate::layout::{
    AccountPaths, BALANCES_ALL_FILE, DEPOSITS_ALL_FILE, SNAPSHOTS_ALL_FILE, TRANSFERS_ALL_FILE, WITHDRAWALS_ALL_FILE,
};
use crate::notify::{Notifier, send_tickers};
use crate::reconcile::balances::{self, BalanceSummary};
use crate::reconcile::{
    Session, StreamContext, StreamReport, StreamStatus, SyncError, history, klines, open_orders, prices, snapshots,
    transfers,
};
use crate::symbols::filter_symbols;

/// Opens upstream connections.
pub trait ExchangeFactory {
    /// A connection for `account`, or a public one for `None`.
    fn connect(&self, account: Option<&AccountConfig>) -> Result<Arc<dyn Exchange>, UpstreamError>;
}

/// Connects to Binance with credentials from the account's environment
/// variables.
pub struct BinanceFactory {
    config: BinanceConfig,
}

impl BinanceFactory {
    pub fn new(config: BinanceConfig) -> Self {
        Self { config }
    }
}

impl ExchangeFactory for BinanceFactory {
    fn connect(&self, account: Option<&AccountConfig>) -> Result<Arc<dyn Exchange>, UpstreamError> {
        let credentials = account
            .map(|a| Credentials::from_env(&a.api_key_env, &a.api_secret_env))
            .transpose()?;
        Ok(Arc::new(BinanceClient::new(self.config.clone(), credentials)?))
    }
}

/// Outcome of one (account, stream) pass.
#[derive(Debug, Clone)]
pub struct RunEntry {
    /// Account name; empty for market-data streams.
    pub account: String,
    pub stream: Stream,
    pub report: StreamReport,
}

/// Per-pass outcomes of a whole run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub entries: Vec<RunEntry>,
}

impl RunReport {
    fn record(&mut self, account: &str, stream: Stream, report: StreamReport) {
        self.entries.push(RunEntry {
            account: account.to_string(),
            stream,
            report,
        });
    }

    pub fn get(&self, account: &str, stream: Stream) -> Option<&StreamReport> {
        self.entries
            .iter()
            .find(|e| e.account == account && e.stream == stream)
            .map(|e| &e.report)
    }

    pub fn new_records(&self) -> usize {
        self.entries.iter().map(|e| e.report.new_records).sum()
    }

    /// Failed passes plus abandoned partitions.
    pub fn failure_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| match e.report.status {
                StreamStatus::Failed => 1,
                _ => e.report.failed_partitions.len(),
            })
            .sum()
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Run Statistics:")?;
        writeln!(f, "  New records: {}", self.new_records())?;
        writeln!(f, "  Failures: {}", self.failure_count())?;
        for entry in &self.entries {
            let account = if entry.account.is_empty() { "-" } else { &entry.account };
            write!(
                f,
                "    {:<12} {:<12} {:?} ({} new)",
                account,
                entry.stream.as_str(),
                entry.report.status, entry.report.new_records
            )?;
            if !entry.report.failed_partitions.is_empty() {
                write!(f, " failed: {}", entry.report.failed_partitions.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Runs every enabled stream for every configured account.
pub struct Aggregator<'a> {
    config: &'a SyncConfig,
    factory: &'a dyn ExchangeFactory,
    notifier: Option<&'a dyn Notifier>,
    clock: fn() -> i64,
}

impl<'a> Aggregator<'a> {
    pub fn new(config: &'a SyncConfig, factory: &'a dyn ExchangeFactory) -> Self {
        Self {
            config,
            factory,
            notifier: None,
            clock: now_ms,
        }
    }

    pub fn with_notifier(mut self, notifier: &'a dyn Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Returns `Err` only for fatal errors; everything else is in the report.
    pub async fn run(&self) -> Result<RunReport, SyncError> {
        let modules = &self.config.modules;
        let mut report = RunReport::default();

        if modules.is_enabled(Stream::Ticker) {
            self.send_tickers(&mut report).await?;
        }

        let needs_pairs = modules.is_enabled(Stream::Trades) || modules.is_enabled(Stream::Orders);
        let trade_pairs = if needs_pairs {
            self.discover_symbols(&self.config.trade_pair_patterns).await?
        } else {
            Some(Vec::new())
        };

        for stream in Stream::ACCOUNT_STREAMS {
            if !modules.is_enabled(stream) {
                continue;
            }
            info!(stream = %stream, accounts = self.config.accounts.len(), "Starting stream");

            for account in &self.config.accounts {
                let pass = match (stream, trade_pairs.as_deref()) {
                    (Stream::Trades | Stream::Orders, None) => StreamReport::failed("trading pairs unavailable"),
                    (_, pairs) => {
                        self.run_account_stream(account, stream, pairs.unwrap_or_default())
                            .await?
                    }
                };
                report.record(&account.name, stream, pass);
            }

            self.merge_combined(stream)?;
        }

        if modules.is_enabled(Stream::Prices) {
            let pass = self.market_pass(MarketJob::Prices).await?;
            report.record("", Stream::Prices, pass);
        }

        if modules.is_enabled(Stream::Klines) {
            let pass = match self.discover_symbols(&self.config.klines.symbols).await? {
                Some(pairs) => self.market_pass(MarketJob::Klines(pairs)).await?,
                None => StreamReport::failed("trading pairs unavailable"),
            };
            report.record("", Stream::Klines, pass);
        }

        info!(
            new_records = report.new_records(),
            failures = report.failure_count(),
            "Run finished"
        );
        Ok(report)
    }

    async fn run_account_stream(
        &self,
        account: &AccountConfig,
        stream: Stream,
        pairs: &[String],
    ) -> Result<StreamReport, SyncError> {
        let exchange = match self.factory.connect(Some(account)) {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(account = %account.name, stream = %stream, error = %e, "Cannot connect, skipping account");
                return Ok(StreamReport::failed(e.to_string()));
            }
        };

        let paths = AccountPaths::new(&self.config.data_dir, account);
        let ctx = StreamContext {
            account,
            paths: &paths,
            config: &self.config.reconcile,
            now_ms: (self.clock)(),
        };
        let mut session = Session::new(exchange.as_ref(), self.config.rate_limit.clone());

        info!(account = %account.name, stream = %stream, "Reconciling");
        let result = match stream {
            Stream::Balances => balances::reconcile_balances(&mut session, &ctx).await.map(|(r, _)| r),
            Stream::Trades => history::reconcile_trades(&mut session, &ctx, pairs).await,
            Stream::Orders => history::reconcile_orders(&mut session, &ctx, pairs).await,
            Stream::OpenOrders => open_orders::reconcile_open_orders(&mut session, &ctx).await,
            Stream::Deposits => transfers::reconcile_deposits(&mut session, &ctx).await,
            Stream::Withdrawals => transfers::reconcile_withdrawals(&mut session, &ctx).await,
            Stream::Snapshots => snapshots::reconcile_snapshots(&mut session, &ctx).await,
            Stream::Prices | Stream::Klines | Stream::Ticker => Ok(StreamReport::unsupported()),
        };
        session.close().await;

        absorb_upstream(result, &account.name, stream)
    }

    /// Runs a market-data job over a public connection.
    async fn market_pass(&self, job: MarketJob) -> Result<StreamReport, SyncError> {
        let stream = job.stream();
        let exchange = match self.factory.connect(None) {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(stream = %stream, error = %e, "Cannot connect");
                return Ok(StreamReport::failed(e.to_string()));
            }
        };
        let mut session = Session::new(exchange.as_ref(), self.config.rate_limit.clone());

        info!(stream = %stream, "Updating market data");
        let result = match &job {
            MarketJob::Prices => prices::reconcile_prices(&mut session, &self.config.data_dir).await,
            MarketJob::Klines(pairs) => {
                klines::reconcile_klines(&mut session, &self.config.klines_dir(), pairs, &self.config.klines).await
            }
        };
        session.close().await;

        absorb_upstream(result, "", stream)
    }

    /// Pairs matching `patterns`; `None` if the ticker list is unavailable.
    async fn discover_symbols(&self, patterns: &[String]) -> Result<Option<Vec<String>>, SyncError> {
        let exchange = match self.factory.connect(None) {
            Ok(exchange) => exchange,
            Err(e) => {
                warn!(error = %e, "Cannot connect for symbol discovery");
                return Ok(None);
            }
        };
        let mut session = Session::new(exchange.as_ref(), self.config.rate_limit.clone());
        if let Err(e) = session.throttle().await {
            session.close().await;
            return Err(e.into());
        }
        let tickers = session.exchange().tickers().await;
        session.close().await;

        match tickers {
            Ok(tickers) => {
                let symbols = filter_symbols(&tickers, patterns);
                info!(pairs = symbols.len(), ?patterns, "Discovered trading pairs");
                Ok(Some(symbols))
            }
            Err(e) => {
                warn!(error = %e, "Symbol discovery failed");
                Ok(None)
            }
        }
    }

    /// Reads live balances of every account and sends the ticker messages.
    async fn send_tickers(&self, report: &mut RunReport) -> Result<(), SyncError> {
        let Some(notifier) = self.notifier else {
            warn!("Ticker enabled but no notifier configured");
            return Ok(());
        };

        let mut summaries: Vec<(&AccountConfig, BalanceSummary)> = Vec::new();
        for account in &self.config.accounts {
            let exchange = match self.factory.connect(Some(account)) {
                Ok(exchange) => exchange,
                Err(e) => {
                    warn!(account = %account.name, error = %e, "Cannot connect, no ticker for account");
                    report.record(&account.name, Stream::Ticker, StreamReport::failed(e.to_string()));
                    continue;
                }
            };

            let paths = AccountPaths::new(&self.config.data_dir, account);
            let ctx = StreamContext {
                account,
                paths: &paths,
                config: &self.config.reconcile,
                now_ms: (self.clock)(),
            };
            let mut session = Session::new(exchange.as_ref(), self.config.rate_limit.clone());
            let result = balances::read_balances(&mut session, &ctx).await;
            session.close().await;

            match result {
                Ok((_, summary)) => summaries.push((account, summary)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(account = %account.name, error = %e, "Balance read failed, no ticker for account");
                    report.record(&account.name, Stream::Ticker, StreamReport::failed(e.to_string()));
                }
            }
        }

        let sent = send_tickers(notifier, &summaries, &self.config.account_groups).await;
        report.record("", Stream::Ticker, StreamReport::persisted(sent, Vec::new()));
        Ok(())
    }

    /// Concatenates per-account ledgers of `stream` into the combined files.
    fn merge_combined(&self, stream: Stream) -> Result<(), SyncError> {
        let (ledger, combined): (fn(&AccountPaths) -> PathBuf, &str) = match stream {
            Stream::Balances => (AccountPaths::balances, BALANCES_ALL_FILE),
            Stream::Snapshots => (AccountPaths::snapshot_balances, SNAPSHOTS_ALL_FILE),
            Stream::Deposits => (AccountPaths::deposits, DEPOSITS_ALL_FILE),
            Stream::Withdrawals => (AccountPaths::withdrawals, WITHDRAWALS_ALL_FILE),
            _ => return Ok(()),
        };

        let data_dir = &self.config.data_dir;
        let sources: Vec<PathBuf> = self
            .config
            .accounts
            .iter()
            .map(|a| ledger(&AccountPaths::new(data_dir, a)))
            .collect();
        let target = data_dir.join(combined);
        let rows = merge_files(&sources, &target)?;
        info!(file = %target.display(), rows, "Combined ledger written");

        if matches!(stream, Stream::Deposits | Stream::Withdrawals) {
            let transfers = [data_dir.join(DEPOSITS_ALL_FILE), data_dir.join(WITHDRAWALS_ALL_FILE)];
            let target = data_dir.join(TRANSFERS_ALL_FILE);
            let rows = merge_files(&transfers, &target)?;
            info!(file = %target.display(), rows, "Combined ledger written");
        }
        Ok(())
    }
}

enum MarketJob {
    Prices,
    Klines(Vec<String>),
}

impl MarketJob {
    fn stream(&self) -> Stream {
        match self {
            MarketJob::Prices => Stream::Prices,
            MarketJob::Klines(_) => Stream::Klines,
        }
    }
}

/// Turns upstream errors into a failed report; fatal errors pass through.
fn absorb_upstream(
    result: Result<StreamReport, SyncError>,
    account: &str,
    stream: Stream,
) -> Result<StreamReport, SyncError> {
    match result {
        Ok(report) => Ok(report),
        Err(e) if e.is_fatal() => {
            error!(account, stream = %stream, error = %e, "Fatal error");
            Err(e)
        }
        Err(e) => {
            warn!(account, stream = %stream, error = %e, "Stream failed");
            Ok(StreamReport::failed(e.to_string()))
        }
    }
}
