//! Technical indicators over candle ledgers.
//!
//! Indicators are recomputed over the whole stored series every run, so a
//! refreshed last candle updates its indicator values too. Values before an
//! indicator's warm-up period are left empty.

use ledger_common::KlineRow;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Decimal places indicator values are rounded to.
const INDICATOR_DP: u32 = 8;

/// EMA/DEMA periods written to the ledger.
const EMA_PERIODS: [usize; 3] = [50, 100, 200];

/// Which indicators to compute.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub rsi: bool,
    pub williams_r: bool,
    /// RSI + Williams %R.
    pub wrsi: bool,
    pub ema: bool,
    pub dema: bool,
    pub rsi_period: usize,
    pub williams_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi: true,
            williams_r: true,
            wrsi: true,
            ema: true,
            dema: false,
            rsi_period: 14,
            williams_period: 14,
        }
    }
}

/// Fills the indicator columns of an ascending candle series.
pub fn apply(rows: &mut [KlineRow], config: &IndicatorConfig) {
    let closes: Vec<Decimal> = rows.iter().map(|r| r.close).collect();

    let rsi_values = if config.rsi || config.wrsi {
        rsi(&closes, config.rsi_period)
    } else {
        vec![None; rows.len()]
    };
    let williams_values = if config.williams_r || config.wrsi {
        williams_r(rows, config.williams_period)
    } else {
        vec![None; rows.len()]
    };

    let [ema50, ema100, ema200] = EMA_PERIODS.map(|p| {
        if config.ema || config.dema {
            ema(&closes.iter().copied().map(Some).collect::<Vec<_>>(), p)
        } else {
            vec![None; rows.len()]
        }
    });
    let [dema50, dema100, dema200] = [(&ema50, 50), (&ema100, 100), (&ema200, 200)].map(|(first, p)| {
        if config.dema {
            dema(first, p)
        } else {
            vec![None; rows.len()]
        }
    });

    for (i, row) in rows.iter_mut().enumerate() {
        row.rsi = rsi_values[i].filter(|_| config.rsi).map(round);
        row.williams_r = williams_values[i].filter(|_| config.williams_r).map(round);
        row.wrsi = match (config.wrsi, rsi_values[i], williams_values[i]) {
            (true, Some(r), Some(w)) => Some(round(r + w)),
            _ => None,
        };
        row.ema50 = ema50[i].filter(|_| config.ema).map(round);
        row.ema100 = ema100[i].filter(|_| config.ema).map(round);
        row.ema200 = ema200[i].filter(|_| config.ema).map(round);
        row.dema50 = dema50[i].map(round);
        row.dema100 = dema100[i].map(round);
        row.dema200 = dema200[i].map(round);
    }
}

fn round(value: Decimal) -> Decimal {
    value.round_dp(INDICATOR_DP).normalize()
}

/// Wilder's RSI.
pub fn rsi(closes: &[Decimal], period: usize) -> Vec<Option<Decimal>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }

    let p = Decimal::from(period);
    let mut avg_gain = Decimal::ZERO;
    let mut avg_loss = Decimal::ZERO;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change > Decimal::ZERO {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= p;
    avg_loss /= p;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let (gain, loss) = if change > Decimal::ZERO {
            (change, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -change)
        };
        avg_gain = (avg_gain * (p - Decimal::ONE) + gain) / p;
        avg_loss = (avg_loss * (p - Decimal::ONE) + loss) / p;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: Decimal, avg_loss: Decimal) -> Decimal {
    if avg_loss.is_zero() {
        return if avg_gain.is_zero() { dec!(50) } else { dec!(100) };
    }
    dec!(100) - dec!(100) / (Decimal::ONE + avg_gain / avg_loss)
}

/// Williams %R in `[-100, 0]`. Flat windows have no value.
pub fn williams_r(rows: &[KlineRow], period: usize) -> Vec<Option<Decimal>> {
    let mut out = vec![None; rows.len()];
    if period == 0 {
        return out;
    }
    for i in (period - 1)..rows.len() {
        let window = &rows[i + 1 - period..=i];
        let highest = window.iter().map(|r| r.high).max().unwrap_or_default();
        let lowest = window.iter().map(|r| r.low).min().unwrap_or_default();
        let range = highest - lowest;
        if !range.is_zero() {
            out[i] = Some(dec!(-100) * (highest - rows[i].close) / range);
        }
    }
    out
}

/// Exponential moving average seeded with the simple average of the first
/// `period` values. Leading `None`s are skipped.
pub fn ema(values: &[Option<Decimal>], period: usize) -> Vec<Option<Decimal>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }
    let points: Vec<(usize, Decimal)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();
    if points.len() < period {
        return out;
    }

    let alpha = dec!(2) / Decimal::from(period + 1);
    let seed: Decimal = points[..period].iter().map(|(_, v)| *v).sum::<Decimal>() / Decimal::from(period);
    let mut current = seed;
    out[points[period - 1].0] = Some(current);
    for (i, value) in &points[period..] {
        current += (*value - current) * alpha;
        out[*i] = Some(current);
    }
    out
}

/// Double EMA: `2 × EMA − EMA(EMA)`.
pub fn dema(first: &[Option<Decimal>], period: usize) -> Vec<Option<Decimal>> {
    let second = ema(first, period);
    first
        .iter()
        .zip(&second)
        .map(|(a, b)| match (a, b) {
            (Some(a), Some(b)) => Some(dec!(2) * *a - *b),
            _ => None,
        })
        .collect()
}
