//! Currently open orders. The ledger is replaced on every run.

use ledger_common::ledger::{self, WriteMode};
use ledger_common::{AccountType, OrderRow, merge_records};
use tracing::info;

use super::{Session, StreamContext, StreamReport, SyncError};

pub async fn reconcile_open_orders(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
) -> Result<StreamReport, SyncError> {
    if ctx.account.account_type == AccountType::Futures {
        return Ok(StreamReport::unsupported());
    }

    session.throttle().await?;
    let orders = session.exchange().open_orders().await?;
    let rows: Vec<OrderRow> = merge_records(Vec::new(), orders.into_iter().map(OrderRow::from).collect());

    ledger::write(&ctx.paths.open_orders(), &rows, WriteMode::Overwrite)?;
    info!(account = %ctx.account.name, open_orders = rows.len(), "Open orders written");
    Ok(StreamReport::persisted(rows.len(), Vec::new()))
}
