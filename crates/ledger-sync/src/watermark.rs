//! Watermark resolution.
//!
//! A watermark is the exclusive lower bound (epoch ms) of the next fetch for a
//! ledger or one partition of it. It is always derived from the rows already
//! on disk and never stored separately, so a ledger that is deleted is simply
//! fetched again from the stream's origin.

use std::collections::HashMap;

use ledger_common::LedgerRecord;

/// Origin of deposit and withdrawal history (2017-07-01, exchange launch).
pub const TRANSFER_ORIGIN_MS: i64 = 1_498_870_800_000;

/// Watermark of an unpartitioned ledger: latest timestamp + 1, or `origin`.
pub fn resolve<T: LedgerRecord>(existing: &[T], origin: i64) -> i64 {
    existing
        .iter()
        .map(LedgerRecord::sort_time)
        .max()
        .map_or(origin, |latest| latest + 1)
}

/// Watermark ignoring the most recent row.
///
/// Used for candle ledgers, whose latest row may have been written while the
/// candle was still open and must be fetched again.
pub fn resolve_excluding_latest<T: LedgerRecord>(existing: &[T], origin: i64) -> i64 {
    let Some(latest) = existing.iter().map(LedgerRecord::sort_time).max() else {
        return origin;
    };
    let mut skipped = false;
    existing
        .iter()
        .map(LedgerRecord::sort_time)
        .filter(|t| {
            if *t == latest && !skipped {
                skipped = true;
                return false;
            }
            true
        })
        .max()
        .map_or(origin, |t| t + 1)
}

/// Per-partition watermarks of a partitioned ledger.
#[derive(Debug, Default, Clone)]
pub struct PartitionWatermarks {
    latest: HashMap<String, i64>,
}

impl PartitionWatermarks {
    pub fn resolve<T: LedgerRecord>(existing: &[T], partition: impl Fn(&T) -> &str) -> Self {
        let mut latest: HashMap<String, i64> = HashMap::new();
        for row in existing {
            let time = row.sort_time();
            latest
                .entry(partition(row).to_string())
                .and_modify(|t| *t = (*t).max(time))
                .or_insert(time);
        }
        Self { latest }
    }

    /// Watermark of one partition; 0 if the ledger has no rows for it.
    pub fn get(&self, key: &str) -> i64 {
        self.latest.get(key).map_or(0, |t| t + 1)
    }
}

/// Returns `None` when the gap between `watermark` and `now` is shorter than
/// `min_span`, meaning no newer data can exist yet.
pub fn due_since(watermark: i64, now: i64, min_span: i64) -> Option<i64> {
    (now - watermark >= min_span).then_some(watermark)
}
