//! Candle history per trading pair and interval.
//!
//! Public market data: no account or credentials involved. Each (interval,
//! pair) ledger is extended from its watermark, the last stored candle is
//! re-fetched in case it was still open, and indicators are recomputed over
//! the whole series. Daily candles of all pairs are also combined into one
//! file.

use std::path::Path;

use ledger_common::ledger::{self, LedgerError, WriteMode};
use ledger_common::time::utc_from_ms;
use ledger_common::{KlineRow, PairKlineRow, merge_records};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Session, StreamReport, SyncError};
use crate::binance::{Kline, MAX_KLINES_PER_REQUEST};
use crate::indicators::{self, IndicatorConfig};
use crate::layout::{DAILY_KLINES_ALL_FILE, kline_path, pair_from_kline_file};
use crate::watermark::resolve_excluding_latest;

/// Interval whose candles are combined into the all-pairs file.
pub const DAILY_INTERVAL: &str = "1d";

/// `[klines]` configuration section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KlinesConfig {
    /// Directory under the data directory.
    pub dir: String,
    /// Pair patterns; a pair is included if it contains any of them.
    pub symbols: Vec<String>,
    pub intervals: Vec<String>,
    pub indicators: IndicatorConfig,
}

impl Default for KlinesConfig {
    fn default() -> Self {
        Self {
            dir: "klines".to_string(),
            symbols: vec!["USDT".to_string()],
            intervals: vec![DAILY_INTERVAL.to_string()],
            indicators: IndicatorConfig::default(),
        }
    }
}

fn kline_row(k: &Kline) -> KlineRow {
    KlineRow {
        open_time: utc_from_ms(k.open_time),
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        volume: k.volume,
        open_time_ux: k.open_time,
        rsi: None,
        williams_r: None,
        wrsi: None,
        ema50: None,
        ema100: None,
        ema200: None,
        dema50: None,
        dema100: None,
        dema200: None,
    }
}

pub async fn reconcile_klines(
    session: &mut Session<'_>,
    klines_dir: &Path,
    symbols: &[String],
    config: &KlinesConfig,
) -> Result<StreamReport, SyncError> {
    let mut new_records = 0;
    let mut failed = Vec::new();

    for interval in &config.intervals {
        info!(interval = %interval, pairs = symbols.len(), "Updating klines");

        for (i, pair) in symbols.iter().enumerate() {
            let path = kline_path(klines_dir, interval, pair);
            let existing: Vec<KlineRow> = ledger::read(&path)?.unwrap_or_default();
            let start = resolve_excluding_latest(&existing, 0);

            let candles = match fetch_candles(session, pair, interval, start).await? {
                Ok(candles) => candles,
                Err(reason) => {
                    warn!(pair = %pair, interval = %interval, reason = %reason, "Skipping pair");
                    failed.push(format!("{pair} {interval}"));
                    continue;
                }
            };
            if candles.len() < 2 {
                debug!(pair = %pair, interval = %interval, "No new candles");
                continue;
            }

            let fetched = candles.len();
            let mut merged = merge_records(existing, candles.iter().map(kline_row).collect());
            indicators::apply(&mut merged, &config.indicators);
            ledger::write(&path, &merged, WriteMode::Overwrite)?;
            new_records += fetched;

            debug!(
                pair = %pair,
                interval = %interval,
                fetched,
                total = merged.len(),
                index = i + 1,
                pairs = symbols.len(),
                "Klines written"
            );
        }
    }

    if config.intervals.iter().any(|i| i == DAILY_INTERVAL) {
        merge_daily_klines(klines_dir)?;
    }

    info!(new_records, failed_pairs = failed.len(), "Klines updated");
    if new_records == 0 {
        return Ok(StreamReport::up_to_date(failed));
    }
    Ok(StreamReport::persisted(new_records, failed))
}

/// Pages candles forward from `start`. The inner error is an absorbed
/// upstream failure for this pair.
async fn fetch_candles(
    session: &mut Session<'_>,
    pair: &str,
    interval: &str,
    start: i64,
) -> Result<Result<Vec<Kline>, String>, SyncError> {
    let mut candles: Vec<Kline> = Vec::new();
    let mut start = start;

    loop {
        session.throttle().await?;
        let page = match session
            .exchange()
            .klines(pair, interval, start, None, MAX_KLINES_PER_REQUEST)
            .await
        {
            Ok(page) => page,
            Err(e) => return Ok(Err(e.to_string())),
        };
        let full = page.len() as u32 >= MAX_KLINES_PER_REQUEST;
        let next = page.last().map(|k| k.open_time + 1);
        candles.extend(page);

        match next {
            Some(next) if full && next > start => start = next,
            _ => return Ok(Ok(candles)),
        }
    }
}

/// Combines every daily candle ledger into the all-pairs file, sorted by pair
/// then open time. Returns the number of rows written.
pub fn merge_daily_klines(klines_dir: &Path) -> Result<usize, LedgerError> {
    let daily_dir = klines_dir.join(DAILY_INTERVAL);
    if !daily_dir.is_dir() {
        return Ok(0);
    }

    let mut files: Vec<(String, std::path::PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(&daily_dir).map_err(|e| LedgerError::io(&daily_dir, e))? {
        let entry = entry.map_err(|e| LedgerError::io(&daily_dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(pair) = pair_from_kline_file(&name, DAILY_INTERVAL) {
            files.push((pair, entry.path()));
        }
    }
    files.sort();

    let mut rows = Vec::new();
    for (pair, path) in &files {
        let candles: Vec<KlineRow> = ledger::read(path)?.unwrap_or_default();
        rows.extend(candles.iter().map(|k| PairKlineRow::from_kline(k, pair)));
    }

    let mut merged = merge_records(Vec::new(), rows);
    merged.sort_by(|a, b| a.pair.cmp(&b.pair).then(a.open_time_ux.cmp(&b.open_time_ux)));
    ledger::write(&klines_dir.join(DAILY_KLINES_ALL_FILE), &merged, WriteMode::Overwrite)?;

    info!(pairs = files.len(), rows = merged.len(), "Merged daily klines");
    Ok(merged.len())
}
