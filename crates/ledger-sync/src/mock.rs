//! In-memory exchange for reconciler tests.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use ledger_common::AccountType;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::binance::{
    ApiDeposit, ApiOrder, ApiSnapshot, ApiTrade, ApiWithdrawal, Exchange, FuturesAccount, Kline, SpotAccount,
    TickerPrice, UpstreamError,
};
use crate::rate::{WeightDimension, WeightUsage};

#[derive(Default)]
struct MockState {
    usage: Option<WeightUsage>,
    keepalive_usage: VecDeque<WeightUsage>,
    keepalive_calls: u32,
    keepalive_fails: bool,
    closed: u32,
    /// Remaining failures per call label before it succeeds.
    transient_failures: HashMap<String, u32>,
    /// Call prefix and count after which usage jumps to the limit.
    exhaust_after: Option<(String, usize)>,
    calls: Vec<String>,
}

/// Scripted exchange. Data fields are set directly by tests.
#[derive(Default)]
pub struct MockExchange {
    pub tickers: Vec<TickerPrice>,
    pub spot_account: Option<SpotAccount>,
    pub futures_account: Option<FuturesAccount>,
    pub trades: HashMap<String, Vec<ApiTrade>>,
    pub orders: HashMap<String, Vec<ApiOrder>>,
    pub open_orders: Vec<ApiOrder>,
    pub deposits: Vec<ApiDeposit>,
    pub withdrawals: Vec<ApiWithdrawal>,
    pub snapshots: Vec<ApiSnapshot>,
    /// Candles keyed by (symbol, interval).
    pub klines: HashMap<(String, String), Vec<Kline>>,
    /// Symbols whose history calls always fail.
    pub failing_symbols: HashSet<String>,
    /// Symbols whose paged history calls return the first page forever.
    pub stuck_symbols: HashSet<String>,
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn with_tickers(mut self, prices: &[(&str, Decimal)]) -> Self {
        self.tickers = prices
            .iter()
            .map(|(symbol, price)| TickerPrice {
                symbol: symbol.to_string(),
                price: *price,
            })
            .collect();
        self
    }

    pub fn set_usage(&self, usage: WeightUsage) {
        self.state.lock().usage = Some(usage);
    }

    /// Usage readings returned by successive keep-alive calls.
    pub fn script_keepalive_usage(&self, usages: Vec<WeightUsage>) {
        self.state.lock().keepalive_usage = usages.into();
    }

    pub fn fail_keepalive(&self) {
        self.state.lock().keepalive_fails = true;
    }

    /// Makes the next `times` calls with the given label fail.
    pub fn fail_next(&self, label: &str, times: u32) {
        self.state.lock().transient_failures.insert(label.to_string(), times);
    }

    /// Reports the full request weight as used once `calls` calls starting
    /// with `prefix` have been made.
    pub fn exhaust_usage_after(&self, prefix: &str, calls: usize) {
        self.state.lock().exhaust_after = Some((prefix.to_string(), calls));
    }

    pub fn keepalive_calls(&self) -> u32 {
        self.state.lock().keepalive_calls
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().closed
    }

    /// Labels of every upstream call so far, e.g. `my_trades BTCUSDT`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, label: String) -> Result<(), UpstreamError> {
        let mut state = self.state.lock();
        state.calls.push(label.clone());
        let exhausted = state.exhaust_after.as_ref().is_some_and(|(prefix, limit)| {
            state.calls.iter().filter(|c| c.starts_with(prefix.as_str())).count() >= *limit
        });
        if exhausted {
            let dimension = WeightDimension::RequestWeight1m;
            state.usage = Some(WeightUsage::new(dimension, dimension.limit()));
        }
        let name = label.split_whitespace().next().unwrap_or_default().to_string();
        for key in [label, name] {
            if let Some(remaining) = state.transient_failures.get_mut(&key)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(UpstreamError::InvalidResponse(format!("scripted failure for {key}")));
            }
        }
        Ok(())
    }

    fn symbol_page<T: Clone>(
        &self,
        symbol: &str,
        items: Option<&Vec<T>>,
        time: impl Fn(&T) -> i64,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<T>, UpstreamError> {
        if self.failing_symbols.contains(symbol) {
            return Err(UpstreamError::InvalidResponse(format!("{symbol} unavailable")));
        }
        let mut items: Vec<T> = items.cloned().unwrap_or_default();
        items.sort_by_key(|item| time(item));
        let limit = limit as usize;
        Ok(match start_time {
            None => {
                let skip = items.len().saturating_sub(limit);
                items.into_iter().skip(skip).collect()
            }
            Some(_) if self.stuck_symbols.contains(symbol) => items.into_iter().take(limit).collect(),
            Some(start) => items.into_iter().filter(|i| time(i) >= start).take(limit).collect(),
        })
    }
}

#[async_trait]
impl Exchange for MockExchange {
    async fn tickers(&self) -> Result<Vec<TickerPrice>, UpstreamError> {
        self.record("tickers".to_string())?;
        Ok(self.tickers.clone())
    }

    async fn spot_account(&self) -> Result<SpotAccount, UpstreamError> {
        self.record("spot_account".to_string())?;
        self.spot_account
            .clone()
            .ok_or_else(|| UpstreamError::InvalidResponse("no spot account".to_string()))
    }

    async fn futures_account(&self) -> Result<FuturesAccount, UpstreamError> {
        self.record("futures_account".to_string())?;
        self.futures_account
            .clone()
            .ok_or_else(|| UpstreamError::InvalidResponse("no futures account".to_string()))
    }

    async fn my_trades(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ApiTrade>, UpstreamError> {
        self.record(format!("my_trades {symbol}"))?;
        self.symbol_page(symbol, self.trades.get(symbol), |t| t.time, start_time, limit)
    }

    async fn all_orders(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ApiOrder>, UpstreamError> {
        self.record(format!("all_orders {symbol}"))?;
        self.symbol_page(symbol, self.orders.get(symbol), |o| o.time, start_time, limit)
    }

    async fn open_orders(&self) -> Result<Vec<ApiOrder>, UpstreamError> {
        self.record("open_orders".to_string())?;
        Ok(self.open_orders.clone())
    }

    async fn deposit_history(&self, start_time: i64, end_time: i64) -> Result<Vec<ApiDeposit>, UpstreamError> {
        self.record(format!("deposit_history {start_time}"))?;
        Ok(self
            .deposits
            .iter()
            .filter(|d| d.insert_time >= start_time && d.insert_time <= end_time)
            .cloned()
            .collect())
    }

    async fn withdraw_history(&self, start_time: i64, end_time: i64) -> Result<Vec<ApiWithdrawal>, UpstreamError> {
        self.record(format!("withdraw_history {start_time}"))?;
        Ok(self
            .withdrawals
            .iter()
            .filter(|w| {
                ledger_common::time::parse_utc_ms(&w.apply_time)
                    .is_some_and(|t| t >= start_time && t <= end_time)
            })
            .cloned()
            .collect())
    }

    async fn account_snapshots(
        &self,
        account_type: AccountType,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<ApiSnapshot>, UpstreamError> {
        self.record(format!("account_snapshots {account_type} {start_time}"))?;
        Ok(self
            .snapshots
            .iter()
            .filter(|s| s.update_time >= start_time && s.update_time <= end_time)
            .take(30)
            .cloned()
            .collect())
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Kline>, UpstreamError> {
        self.record(format!("klines {symbol} {interval}"))?;
        if self.failing_symbols.contains(symbol) {
            return Err(UpstreamError::InvalidResponse(format!("{symbol} unavailable")));
        }
        let key = (symbol.to_string(), interval.to_string());
        Ok(self
            .klines
            .get(&key)
            .map(|candles| {
                candles
                    .iter()
                    .filter(|k| k.open_time >= start_time && end_time.is_none_or(|end| k.open_time <= end))
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn keepalive(&self) -> Result<(), UpstreamError> {
        let mut state = self.state.lock();
        state.keepalive_calls += 1;
        if state.keepalive_fails {
            return Err(UpstreamError::InvalidResponse("keepalive refused".to_string()));
        }
        if let Some(next) = state.keepalive_usage.pop_front() {
            state.usage = Some(next);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        self.state.lock().closed += 1;
        Ok(())
    }

    fn last_usage(&self) -> Option<WeightUsage> {
        self.state.lock().usage
    }
}
