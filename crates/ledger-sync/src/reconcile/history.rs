//! Per-pair trade and order history.
//!
//! Both listings are paged forward by time, one trading pair at a time. The
//! newest upstream record of a pair is queried first so pairs without new
//! activity cost a single request.

use std::path::PathBuf;

use async_trait::async_trait;
use ledger_common::ledger::{self, WriteMode};
use ledger_common::{AccountType, LedgerRecord, OrderRow, TradeRow, merge_records};
use tracing::{debug, info, warn};

use super::{Session, StreamContext, StreamReport, SyncError};
use crate::binance::{Exchange, UpstreamError};
use crate::layout::AccountPaths;
use crate::watermark::PartitionWatermarks;

/// Records requested per history page.
pub const HISTORY_PAGE_LIMIT: u32 = 1000;

/// A per-pair, time-ordered upstream listing.
#[async_trait]
pub(crate) trait PairHistory: Sync {
    type Row: LedgerRecord + Send;

    fn label(&self) -> &'static str;

    fn path(&self, paths: &AccountPaths) -> PathBuf;

    fn symbol(row: &Self::Row) -> &str;

    /// Oldest-first page starting at `start_time`, or the newest records when
    /// `start_time` is `None`.
    async fn page(
        &self,
        exchange: &dyn Exchange,
        symbol: &str,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Self::Row>, UpstreamError>;
}

pub(crate) struct Trades;

#[async_trait]
impl PairHistory for Trades {
    type Row = TradeRow;

    fn label(&self) -> &'static str {
        "trades"
    }

    fn path(&self, paths: &AccountPaths) -> PathBuf {
        paths.trades()
    }

    fn symbol(row: &TradeRow) -> &str {
        &row.symbol
    }

    async fn page(
        &self,
        exchange: &dyn Exchange,
        symbol: &str,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<TradeRow>, UpstreamError> {
        let trades = exchange.my_trades(symbol, start_time, limit).await?;
        Ok(trades.into_iter().map(TradeRow::from).collect())
    }
}

pub(crate) struct Orders;

#[async_trait]
impl PairHistory for Orders {
    type Row = OrderRow;

    fn label(&self) -> &'static str {
        "orders"
    }

    fn path(&self, paths: &AccountPaths) -> PathBuf {
        paths.orders()
    }

    fn symbol(row: &OrderRow) -> &str {
        &row.symbol
    }

    async fn page(
        &self,
        exchange: &dyn Exchange,
        symbol: &str,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<OrderRow>, UpstreamError> {
        let orders = exchange.all_orders(symbol, start_time, limit).await?;
        Ok(orders.into_iter().map(OrderRow::from).collect())
    }
}

pub async fn reconcile_trades(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
    symbols: &[String],
) -> Result<StreamReport, SyncError> {
    reconcile_pairs(session, ctx, symbols, &Trades).await
}

pub async fn reconcile_orders(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
    symbols: &[String],
) -> Result<StreamReport, SyncError> {
    reconcile_pairs(session, ctx, symbols, &Orders).await
}

/// How one pair ended.
enum PairOutcome<T> {
    Fetched(Vec<T>),
    Skipped,
    Failed(String),
}

async fn reconcile_pairs<H: PairHistory>(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
    symbols: &[String],
    source: &H,
) -> Result<StreamReport, SyncError> {
    if ctx.account.account_type == AccountType::Futures {
        return Ok(StreamReport::unsupported());
    }

    let path = source.path(ctx.paths);
    let existing: Vec<H::Row> = ledger::read(&path)?.unwrap_or_default();
    let watermarks = PartitionWatermarks::resolve(&existing, H::symbol);

    let mut fetched = Vec::new();
    let mut failed = Vec::new();

    for (i, symbol) in symbols.iter().enumerate() {
        if i > 0 && !ctx.config.pair_delay.is_zero() {
            tokio::time::sleep(ctx.config.pair_delay).await;
        }

        match fetch_pair(session, source, symbol, watermarks.get(symbol)).await? {
            PairOutcome::Fetched(rows) => {
                debug!(
                    account = %ctx.account.name,
                    stream = source.label(),
                    symbol = %symbol,
                    rows = rows.len(),
                    "Fetched pair"
                );
                fetched.extend(rows);
            }
            PairOutcome::Skipped => {}
            PairOutcome::Failed(reason) => {
                warn!(
                    account = %ctx.account.name,
                    stream = source.label(),
                    symbol = %symbol,
                    reason = %reason,
                    "Skipping pair"
                );
                failed.push(symbol.clone());
            }
        }
    }

    if fetched.is_empty() {
        info!(account = %ctx.account.name, stream = source.label(), "No new records");
        return Ok(StreamReport::up_to_date(failed));
    }

    let new_records = fetched.len();
    let merged = merge_records(existing, fetched);
    ledger::write(&path, &merged, WriteMode::Overwrite)?;

    info!(
        account = %ctx.account.name,
        stream = source.label(),
        new_records,
        total = merged.len(),
        failed_pairs = failed.len(),
        "Ledger updated"
    );
    Ok(StreamReport::persisted(new_records, failed))
}

/// Pages one pair forward from its watermark until the newest upstream record
/// is reached. Any upstream failure or stalled page discards the pair's batch.
async fn fetch_pair<H: PairHistory>(
    session: &mut Session<'_>,
    source: &H,
    symbol: &str,
    watermark: i64,
) -> Result<PairOutcome<H::Row>, SyncError> {
    session.throttle().await?;
    let latest = match source.page(session.exchange(), symbol, None, 1).await {
        Ok(rows) => rows,
        Err(e) => return Ok(PairOutcome::Failed(e.to_string())),
    };
    let Some(latest_time) = latest.iter().map(LedgerRecord::sort_time).max() else {
        return Ok(PairOutcome::Skipped);
    };
    if latest_time < watermark {
        return Ok(PairOutcome::Skipped);
    }

    let mut batch = Vec::new();
    let mut start = watermark;
    let mut previous_last: Option<i64> = None;

    loop {
        session.throttle().await?;
        let page = match source
            .page(session.exchange(), symbol, Some(start), HISTORY_PAGE_LIMIT)
            .await
        {
            Ok(page) => page,
            Err(e) => return Ok(PairOutcome::Failed(e.to_string())),
        };
        let Some(last) = page.last().map(LedgerRecord::sort_time) else {
            return Ok(PairOutcome::Failed(format!("empty page from {start}")));
        };
        if previous_last.is_some_and(|prev| last <= prev) {
            return Ok(PairOutcome::Failed(format!("page from {start} did not advance")));
        }

        batch.extend(page);
        if last >= latest_time {
            return Ok(PairOutcome::Fetched(batch));
        }
        previous_last = Some(last);
        start = last;
    }
}
