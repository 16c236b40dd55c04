//! Daily account snapshots.
//!
//! The exchange keeps one snapshot per account per day for a limited period.
//! Each snapshot is valued with the daily close of its own day and stored as
//! per-asset rows plus one `PortVal` row per day. The `PortVal` row goes to
//! both the assets ledger and the balances ledger.
//! FUTURES snapshots additionally carry open positions (`PosVal` total).
//!
//! The balances ledger drives the watermark: it is the one ledger written
//! for every account type.

use async_trait::async_trait;
use ledger_common::ledger::{self, WriteMode};
use ledger_common::time::{DAY_MS, utc_date_from_ms};
use ledger_common::{
    AccountType, FuturesSnapshotAssetRow, FuturesSnapshotPositionRow, LedgerRecord, PORTFOLIO_TOTAL, POSITION_TOTAL,
    SnapshotAssetRow, SnapshotBalanceRow, merge_records,
};
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{Session, StreamContext, StreamReport, SyncError, WindowSource, fetch_windows};
use crate::binance::{ApiSnapshot, Exchange, UpstreamError};
use crate::valuation::Valuer;
use crate::watermark::{self, due_since};

struct Snapshots {
    account_type: AccountType,
}

#[async_trait]
impl WindowSource for Snapshots {
    type Item = ApiSnapshot;

    fn label(&self) -> &'static str {
        "snapshots"
    }

    async fn fetch(&self, exchange: &dyn Exchange, start: i64, end: i64) -> Result<Vec<ApiSnapshot>, UpstreamError> {
        exchange.account_snapshots(self.account_type, start, end).await
    }
}

/// First timestamp to request: one past the newest stored snapshot, but never
/// further back than the exchange retains.
pub fn snapshot_watermark(existing: &[SnapshotBalanceRow], now: i64, max_days: i64) -> i64 {
    let floor = now - max_days * DAY_MS;
    watermark::resolve(existing, floor).max(floor)
}

pub async fn reconcile_snapshots(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
) -> Result<StreamReport, SyncError> {
    let balances_path = ctx.paths.snapshot_balances();
    let existing_balances: Vec<SnapshotBalanceRow> = ledger::read(&balances_path)?.unwrap_or_default();
    let start = snapshot_watermark(&existing_balances, ctx.now_ms, ctx.config.snapshot_max_days);

    let Some(start) = due_since(start, ctx.now_ms, DAY_MS) else {
        info!(account = %ctx.account.name, stream = "snapshots", "No newer snapshot available");
        return Ok(StreamReport::up_to_date(Vec::new()));
    };

    let source = Snapshots {
        account_type: ctx.account.account_type,
    };
    let window = ctx.config.snapshot_days_per_request * DAY_MS;
    let fetch = fetch_windows(session, ctx.config, &source, start, ctx.now_ms, window).await?;
    let failed: Vec<String> = fetch
        .stopped_at
        .map(|t| vec![format!("window from {}", utc_date_from_ms(t))])
        .unwrap_or_default();

    let mut snapshots = fetch.items;
    if snapshots.is_empty() {
        info!(account = %ctx.account.name, stream = "snapshots", "No new records");
        return Ok(StreamReport::up_to_date(failed));
    }
    snapshots.sort_by_key(|s| s.update_time);

    let mut valuer = Valuer::load(session, &ctx.config.reference_asset).await?;
    let mut balances = existing_balances;
    let mut new_records = 0;

    // Days are written one at a time; a fatal error keeps the days already written.
    for snapshot in &snapshots {
        let total = match ctx.account.account_type {
            AccountType::Spot => {
                let (assets, total) = value_spot(session, &mut valuer, ctx, snapshot).await?;
                merge_into(&ctx.paths.snapshot_assets(), assets)?;
                total
            }
            AccountType::Futures => {
                let (assets, total) = value_futures_assets(session, &mut valuer, ctx, snapshot).await?;
                merge_into(&ctx.paths.snapshot_assets(), assets)?;
                let positions = futures_positions(ctx, snapshot);
                if !positions.is_empty() {
                    merge_into(&ctx.paths.snapshot_positions(), positions)?;
                }
                total
            }
        };

        balances = merge_records(balances, vec![total]);
        ledger::write(&balances_path, &balances, WriteMode::Overwrite)?;
        new_records += 1;
    }

    info!(
        account = %ctx.account.name,
        stream = "snapshots",
        days = new_records,
        total_days = balances.len(),
        "Ledger updated"
    );
    Ok(StreamReport::persisted(new_records, failed))
}

fn merge_into<T: LedgerRecord>(path: &std::path::Path, fetched: Vec<T>) -> Result<(), SyncError> {
    let existing: Vec<T> = ledger::read(path)?.unwrap_or_default();
    let merged = merge_records(existing, fetched);
    ledger::write(path, &merged, WriteMode::Overwrite)?;
    Ok(())
}

async fn value_spot(
    session: &mut Session<'_>,
    valuer: &mut Valuer,
    ctx: &StreamContext<'_>,
    snapshot: &ApiSnapshot,
) -> Result<(Vec<SnapshotAssetRow>, SnapshotBalanceRow), SyncError> {
    let update_time = snapshot.update_time;
    let utc_date = utc_date_from_ms(update_time);

    let mut balances: Vec<_> = snapshot
        .data
        .balances
        .iter()
        .filter(|b| !(b.free.is_zero() && b.locked.is_zero()))
        .collect();
    balances.sort_by(|a, b| a.asset.cmp(&b.asset));

    let mut rows = Vec::with_capacity(balances.len());
    for b in balances {
        let price = valuer.price_at(session, &b.asset, update_time).await?;
        let free_value = b.free * price;
        let locked_value = b.locked * price;
        rows.push(SnapshotAssetRow {
            asset: b.asset.clone(),
            free: Some(b.free),
            locked: Some(b.locked),
            ref_price: Some(price),
            free_value,
            locked_value,
            value: free_value + locked_value,
            update_time,
            utc_date,
            account: ctx.account.name.clone(),
            account_type: AccountType::Spot,
        });
    }
    debug!(account = %ctx.account.name, %utc_date, assets = rows.len(), "Valued snapshot");

    let reference_free = rows
        .iter()
        .find(|r| r.asset == valuer.reference())
        .map_or(Decimal::ZERO, |r| r.free_value);
    let total = SnapshotBalanceRow {
        asset: PORTFOLIO_TOTAL.to_string(),
        free_value: Some(rows.iter().map(|r| r.free_value).sum::<Decimal>() - reference_free),
        locked_value: Some(rows.iter().map(|r| r.locked_value).sum()),
        margin_value: None,
        wallet_value: None,
        pnl: None,
        value: rows.iter().map(|r| r.value).sum(),
        update_time,
        utc_date,
        account: ctx.account.name.clone(),
        account_type: AccountType::Spot,
    };
    rows.push(SnapshotAssetRow {
        asset: PORTFOLIO_TOTAL.to_string(),
        free: None,
        locked: None,
        ref_price: None,
        free_value: total.free_value.unwrap_or_default(),
        locked_value: total.locked_value.unwrap_or_default(),
        value: total.value,
        update_time,
        utc_date,
        account: ctx.account.name.clone(),
        account_type: AccountType::Spot,
    });
    Ok((rows, total))
}

async fn value_futures_assets(
    session: &mut Session<'_>,
    valuer: &mut Valuer,
    ctx: &StreamContext<'_>,
    snapshot: &ApiSnapshot,
) -> Result<(Vec<FuturesSnapshotAssetRow>, SnapshotBalanceRow), SyncError> {
    let update_time = snapshot.update_time;
    let utc_date = utc_date_from_ms(update_time);

    let mut rows = Vec::with_capacity(snapshot.data.assets.len());
    for a in &snapshot.data.assets {
        let price = valuer.price_at(session, &a.asset, update_time).await?;
        let margin_value = a.margin_balance * price;
        rows.push(FuturesSnapshotAssetRow {
            asset: a.asset.clone(),
            margin_balance: Some(a.margin_balance),
            wallet_balance: Some(a.wallet_balance),
            ref_price: Some(price),
            margin_value,
            wallet_value: a.wallet_balance * price,
            pnl: a.margin_balance - a.wallet_balance,
            value: margin_value,
            update_time,
            utc_date,
            account: ctx.account.name.clone(),
            account_type: AccountType::Futures,
        });
    }
    rows.sort_by(|a, b| a.asset.cmp(&b.asset));

    let margin_total: Decimal = rows.iter().map(|r| r.margin_value).sum();
    let wallet_total: Decimal = rows.iter().map(|r| r.wallet_value).sum();
    let pnl_total: Decimal = rows.iter().map(|r| r.pnl).sum();
    rows.push(FuturesSnapshotAssetRow {
        asset: PORTFOLIO_TOTAL.to_string(),
        margin_balance: None,
        wallet_balance: None,
        ref_price: None,
        margin_value: margin_total,
        wallet_value: wallet_total,
        pnl: pnl_total,
        value: margin_total,
        update_time,
        utc_date,
        account: ctx.account.name.clone(),
        account_type: AccountType::Futures,
    });

    let total = SnapshotBalanceRow {
        asset: PORTFOLIO_TOTAL.to_string(),
        free_value: None,
        locked_value: None,
        margin_value: Some(margin_total),
        wallet_value: Some(wallet_total),
        pnl: Some(pnl_total),
        value: margin_total,
        update_time,
        utc_date,
        account: ctx.account.name.clone(),
        account_type: AccountType::Futures,
    };
    Ok((rows, total))
}

/// Positions valued at entry and mark price; closed positions are dropped.
fn futures_positions(ctx: &StreamContext<'_>, snapshot: &ApiSnapshot) -> Vec<FuturesSnapshotPositionRow> {
    let update_time = snapshot.update_time;
    let utc_date = utc_date_from_ms(update_time);

    let mut rows: Vec<FuturesSnapshotPositionRow> = snapshot
        .data
        .position
        .iter()
        .filter(|p| !(p.entry_price.is_zero() && p.position_amt.is_zero() && p.un_realized_profit.is_zero()))
        .map(|p| {
            let entry_value = p.entry_price * p.position_amt;
            let mark_value = p.mark_price * p.position_amt;
            FuturesSnapshotPositionRow {
                symbol: p.symbol.clone(),
                entry_price: Some(p.entry_price),
                mark_price: Some(p.mark_price),
                position_amt: Some(p.position_amt),
                un_realized_profit: p.un_realized_profit,
                entry_value,
                mark_value,
                value_diff: mark_value - entry_value,
                update_time,
                utc_date,
                account: ctx.account.name.clone(),
                account_type: AccountType::Futures,
            }
        })
        .collect();
    if rows.is_empty() {
        return rows;
    }

    rows.push(FuturesSnapshotPositionRow {
        symbol: POSITION_TOTAL.to_string(),
        entry_price: None,
        mark_price: None,
        position_amt: None,
        un_realized_profit: rows.iter().map(|r| r.un_realized_profit).sum(),
        entry_value: rows.iter().map(|r| r.entry_value).sum(),
        mark_value: rows.iter().map(|r| r.mark_value).sum(),
        value_diff: rows.iter().map(|r| r.value_diff).sum(),
        update_time,
        utc_date,
        account: ctx.account.name.clone(),
        account_type: AccountType::Futures,
    });
    rows
}
