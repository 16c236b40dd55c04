//! Valuation in the reference asset.
//!
//! Prices come from two places: the live ticker list (for point-in-time
//! balances) and the 1-day candle covering a historical timestamp (for
//! snapshots and transfers). A price that cannot be determined is 0, never an
//! error; this keeps a delisted coin from blocking a whole ledger.

use std::collections::HashMap;

use ledger_common::time::{DAY_MS, day_start_ms};
use rust_decimal::Decimal;
use tracing::debug;

use crate::binance::TickerPrice;
use crate::reconcile::{Session, SyncError};

/// Reference-asset price lookups for one reconciliation pass.
#[derive(Debug, Clone)]
pub struct Valuer {
    reference: String,
    prices: HashMap<String, Decimal>,
    /// Daily closes keyed by (asset, UTC day start).
    daily_closes: HashMap<(String, i64), Decimal>,
}

impl Valuer {
    pub fn new(reference: &str, tickers: Vec<TickerPrice>) -> Self {
        Self {
            reference: reference.to_string(),
            prices: tickers.into_iter().map(|t| (t.symbol, t.price)).collect(),
            daily_closes: HashMap::new(),
        }
    }

    /// Fetches the ticker list through the session.
    pub async fn load(session: &mut Session<'_>, reference: &str) -> Result<Self, SyncError> {
        session.throttle().await?;
        let tickers = session.exchange().tickers().await?;
        debug!(symbols = tickers.len(), "Loaded ticker prices");
        Ok(Self::new(reference, tickers))
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    fn pair(&self, asset: &str) -> String {
        format!("{asset}{}", self.reference)
    }

    /// True if `asset` trades against the reference asset.
    pub fn is_listed(&self, asset: &str) -> bool {
        asset == self.reference || self.prices.contains_key(&self.pair(asset))
    }

    /// Live price of a trading pair symbol, 0 if unknown.
    pub fn pair_price(&self, symbol: &str) -> Decimal {
        self.prices.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    /// Live price of `asset` in the reference asset.
    pub fn live_price(&self, asset: &str) -> Decimal {
        if asset == self.reference {
            return Decimal::ONE;
        }
        let price = self.pair_price(&self.pair(asset));
        if price.is_zero() {
            debug!(asset, "No live price, valuing at 0");
        }
        price
    }

    /// Close of the 1-day candle covering `as_of`.
    ///
    /// Assets without a reference pair resolve to 0 without an upstream call.
    pub async fn price_at(&mut self, session: &mut Session<'_>, asset: &str, as_of: i64) -> Result<Decimal, SyncError> {
        if asset == self.reference {
            return Ok(Decimal::ONE);
        }
        if !self.is_listed(asset) {
            debug!(asset, "Asset not listed against reference, valuing at 0");
            return Ok(Decimal::ZERO);
        }

        let day = day_start_ms(as_of);
        if let Some(price) = self.daily_closes.get(&(asset.to_string(), day)) {
            return Ok(*price);
        }

        session.throttle().await?;
        let symbol = self.pair(asset);
        let price = match session
            .exchange()
            .klines(&symbol, "1d", day, Some(day + DAY_MS - 1), 1)
            .await
        {
            Ok(candles) => match candles.first() {
                Some(candle) => candle.close,
                None => {
                    debug!(symbol, day, "No daily candle, valuing at 0");
                    Decimal::ZERO
                }
            },
            Err(e) => {
                debug!(symbol, day, error = %e, "Daily candle lookup failed, valuing at 0");
                return Ok(Decimal::ZERO);
            }
        };

        self.daily_closes.insert((asset.to_string(), day), price);
        Ok(price)
    }

    /// Price of `asset` now, or as of a timestamp.
    pub async fn price_of(
        &mut self,
        session: &mut Session<'_>,
        asset: &str,
        as_of: Option<i64>,
    ) -> Result<Decimal, SyncError> {
        match as_of {
            Some(ts) => self.price_at(session, asset, ts).await,
            None => Ok(self.live_price(asset)),
        }
    }
}
