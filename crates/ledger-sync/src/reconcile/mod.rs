//! Stream reconcilers.
//!
//! Each stream follows the same pass for one account:
//! read ledger → resolve watermark → page upstream → enrich → merge → write.
//!
//! Error policy:
//! - Upstream failures inside a partition or page are logged and absorbed
//! - `SyncError::Upstream` escaping a stream marks that stream failed for the account
//! - `SyncError::Ledger` and `SyncError::Rate` abort the run

pub mod balances;
pub mod history;
pub mod klines;
pub mod open_orders;
pub mod prices;
pub mod snapshots;
pub mod transfers;

use std::time::Duration;

use async_trait::async_trait;
use ledger_common::{LedgerError, WriteMode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::binance::{Exchange, UpstreamError};
use crate::config::AccountConfig;
use crate::layout::AccountPaths;
use crate::rate::{RateError, RateGovernor, RateLimitConfig};

/// Errors that end a stream pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Rate limit error: {0}")]
    Rate(#[from] RateError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl SyncError {
    /// Fatal errors abort the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Upstream(_))
    }
}

/// Settings shared by all reconcilers.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Asset every valuation is expressed in.
    pub reference_asset: String,
    /// Pause between trading pairs in per-pair streams.
    pub pair_delay: Duration,
    /// Retries of a failed window page before paging stops.
    pub max_page_retries: u32,
    /// Pause before retrying a failed window page.
    pub retry_delay: Duration,
    /// How far back daily snapshots reach, in days.
    pub snapshot_max_days: i64,
    /// Days covered by one snapshot request.
    pub snapshot_days_per_request: i64,
    /// Write mode of the point-in-time balance ledger.
    pub balance_write_mode: WriteMode,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            reference_asset: "USDT".to_string(),
            pair_delay: Duration::from_secs(1),
            max_page_retries: 5,
            retry_delay: Duration::from_secs(1),
            snapshot_max_days: 180,
            snapshot_days_per_request: 30,
            balance_write_mode: WriteMode::Overwrite,
        }
    }
}

/// One rate-governed connection.
pub struct Session<'a> {
    exchange: &'a dyn Exchange,
    governor: RateGovernor,
}

impl<'a> Session<'a> {
    pub fn new(exchange: &'a dyn Exchange, rate_limit: RateLimitConfig) -> Self {
        Self {
            exchange,
            governor: RateGovernor::new(rate_limit),
        }
    }

    pub fn exchange(&self) -> &'a dyn Exchange {
        self.exchange
    }

    /// Waits until the rate budget allows another call.
    pub async fn throttle(&mut self) -> Result<u64, RateError> {
        self.governor.check(self.exchange).await
    }

    /// Best-effort release of the connection.
    pub async fn close(self) {
        if let Err(e) = self.exchange.close().await {
            debug!(error = %e, "Failed to close connection");
        }
    }
}

/// Per-account inputs of a stream pass.
#[derive(Debug, Clone, Copy)]
pub struct StreamContext<'a> {
    pub account: &'a AccountConfig,
    pub paths: &'a AccountPaths,
    pub config: &'a ReconcileConfig,
    /// Wall clock at the start of the pass, epoch ms.
    pub now_ms: i64,
}

/// Final state of a stream pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamStatus {
    /// New rows were merged and written.
    Persisted,
    /// Nothing newer upstream; the ledger was not touched.
    #[default]
    UpToDate,
    /// The stream does not exist for this account type.
    Unsupported,
    /// The pass ended on an upstream error.
    Failed,
}

/// Outcome of one (account, stream) pass.
#[derive(Debug, Clone, Default)]
pub struct StreamReport {
    pub status: StreamStatus,
    pub new_records: usize,
    /// Partitions (pairs, windows) that were abandoned.
    pub failed_partitions: Vec<String>,
}

impl StreamReport {
    pub fn persisted(new_records: usize, failed_partitions: Vec<String>) -> Self {
        Self {
            status: StreamStatus::Persisted,
            new_records,
            failed_partitions,
        }
    }

    pub fn up_to_date(failed_partitions: Vec<String>) -> Self {
        Self {
            status: StreamStatus::UpToDate,
            new_records: 0,
            failed_partitions,
        }
    }

    pub fn unsupported() -> Self {
        Self {
            status: StreamStatus::Unsupported,
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: StreamStatus::Failed,
            new_records: 0,
            failed_partitions: vec![reason.into()],
        }
    }
}

// =============================================================================
// Windowed paging
// =============================================================================

/// A time-windowed upstream listing.
#[async_trait]
pub(crate) trait WindowSource: Sync {
    type Item: Send;

    fn label(&self) -> &'static str;

    async fn fetch(&self, exchange: &dyn Exchange, start: i64, end: i64) -> Result<Vec<Self::Item>, UpstreamError>;
}

/// Result of walking windows up to now.
pub(crate) struct WindowFetch<T> {
    pub items: Vec<T>,
    /// Start of the window paging stopped at, if it did not reach now.
    pub stopped_at: Option<i64>,
}

/// Walks `[start, start + window]` windows until `now`, advancing by
/// `window + 1`. A window that keeps failing after the configured retries
/// stops the walk; earlier windows are kept.
pub(crate) async fn fetch_windows<S: WindowSource>(
    session: &mut Session<'_>,
    config: &ReconcileConfig,
    source: &S,
    start: i64,
    now: i64,
    window: i64,
) -> Result<WindowFetch<S::Item>, RateError> {
    let mut items = Vec::new();
    let mut window_start = start;

    while window_start < now {
        let window_end = window_start + window;
        let mut failures = 0;

        loop {
            session.throttle().await?;
            match source.fetch(session.exchange(), window_start, window_end).await {
                Ok(page) => {
                    debug!(
                        source = source.label(),
                        start = window_start,
                        end = window_end,
                        rows = page.len(),
                        "Fetched window"
                    );
                    items.extend(page);
                    break;
                }
                Err(e) => {
                    failures += 1;
                    if failures > config.max_page_retries {
                        warn!(
                            source = source.label(),
                            start = window_start,
                            error = %e,
                            "Window still failing after {} retries, stopping",
                            config.max_page_retries
                        );
                        return Ok(WindowFetch {
                            items,
                            stopped_at: Some(window_start),
                        });
                    }
                    warn!(
                        source = source.label(),
                        start = window_start,
                        attempt = failures,
                        error = %e,
                        "Window fetch failed, retrying"
                    );
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }

        window_start = window_end + 1;
    }

    Ok(WindowFetch { items, stopped_at: None })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::time::Duration;

    use ledger_common::{AccountType, WriteMode};
    use rust_decimal::Decimal;

    use super::ReconcileConfig;
    use crate::config::AccountConfig;
    use crate::layout::AccountPaths;
    use crate::rate::RateLimitConfig;

    pub fn account(name: &str, account_type: AccountType) -> AccountConfig {
        AccountConfig {
            name: name.to_string(),
            dir: name.to_string(),
            account_type,
            api_key_env: format!("{}_KEY", name.to_uppercase()),
            api_secret_env: format!("{}_SECRET", name.to_uppercase()),
            chat_pseudo: Some(name.to_string()),
            chat_id: None,
            investment: Decimal::ZERO,
        }
    }

    pub fn config() -> ReconcileConfig {
        ReconcileConfig {
            pair_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            max_page_retries: 2,
            balance_write_mode: WriteMode::Overwrite,
            ..Default::default()
        }
    }

    pub fn rate() -> RateLimitConfig {
        RateLimitConfig::default()
    }

    pub fn paths(root: &Path, account: &AccountConfig) -> AccountPaths {
        AccountPaths::new(root, account)
    }
}
