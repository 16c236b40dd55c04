//! Latest ticker prices of every listed pair.

use std::path::Path;

use ledger_common::PriceRow;
use ledger_common::ledger::{self, WriteMode};
use tracing::info;

use super::{Session, StreamReport, SyncError};
use crate::layout::PRICES_FILE;

pub async fn reconcile_prices(session: &mut Session<'_>, data_dir: &Path) -> Result<StreamReport, SyncError> {
    session.throttle().await?;
    let tickers = session.exchange().tickers().await?;
    let rows: Vec<PriceRow> = tickers
        .into_iter()
        .map(|t| PriceRow {
            symbol: t.symbol,
            price: t.price,
        })
        .collect();

    ledger::write(&data_dir.join(PRICES_FILE), &rows, WriteMode::Overwrite)?;
    info!(symbols = rows.len(), "Prices written");
    Ok(StreamReport::persisted(rows.len(), Vec::new()))
}
