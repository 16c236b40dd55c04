//! Binance REST client.
//!
//! The reconcilers talk to the exchange through the [`Exchange`] trait so they
//! can run against an in-memory fake in tests. [`BinanceClient`] is the real
//! implementation: signed account endpoints (HMAC-SHA256 over the query string),
//! public market-data endpoints, and a user-data-stream listen key used as the
//! keep-alive during rate-limit back-off.
//!
//! Every response, successful or not, updates the connection's last observed
//! weight usage, which the rate governor reads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use ledger_common::time::{now_ms, utc_from_ms};
use ledger_common::{AccountType, OrderRow, TradeRow};
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::rate::WeightUsage;

/// Binance spot and SAPI base URL.
pub const DEFAULT_SPOT_URL: &str = "https://api.binance.com";

/// Binance USD-M futures base URL.
pub const DEFAULT_FUTURES_URL: &str = "https://fapi.binance.com";

/// Maximum candles per klines request.
pub const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Maximum snapshots per account snapshot request.
const MAX_SNAPSHOTS_PER_REQUEST: u32 = 30;

type HmacSha256 = Hmac<Sha256>;

/// Errors returned by the exchange.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (HTTP {status}, code {code}): {msg}")]
    Api { status: u16, code: i64, msg: String },

    #[error("JSON parse error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Configuration for the Binance client.
#[derive(Debug, Clone)]
pub struct BinanceConfig {
    /// Spot and SAPI base URL.
    pub spot_url: String,
    /// USD-M futures base URL.
    pub futures_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// `recvWindow` sent with signed requests, in milliseconds.
    pub recv_window: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            spot_url: DEFAULT_SPOT_URL.to_string(),
            futures_url: DEFAULT_FUTURES_URL.to_string(),
            timeout: Duration::from_secs(30),
            recv_window: 10_000,
        }
    }
}

/// API key pair of one account.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    /// Reads the key pair from the named environment variables.
    pub fn from_env(key_var: &str, secret_var: &str) -> Result<Self, UpstreamError> {
        let read = |var: &str| {
            std::env::var(var)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| UpstreamError::MissingCredentials(var.to_string()))
        };
        Ok(Self {
            api_key: read(key_var)?,
            api_secret: read(secret_var)?,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("api_key", &"***").finish()
    }
}

// =============================================================================
// API payloads
// =============================================================================

/// Latest price of a symbol from `/api/v3/ticker/price`.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiBalance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

/// SPOT account from `/api/v3/account`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotAccount {
    #[serde(default)]
    pub update_time: i64,
    pub balances: Vec<ApiBalance>,
}

/// USD-M futures account from `/fapi/v2/account`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesAccount {
    pub total_initial_margin: Decimal,
    pub total_maint_margin: Decimal,
    pub total_wallet_balance: Decimal,
    pub total_unrealized_profit: Decimal,
    pub total_margin_balance: Decimal,
    pub total_position_initial_margin: Decimal,
    pub total_open_order_initial_margin: Decimal,
    pub available_balance: Decimal,
    pub max_withdraw_amount: Decimal,
    #[serde(default)]
    pub update_time: i64,
    #[serde(default)]
    pub assets: Vec<ApiFuturesAsset>,
    #[serde(default)]
    pub positions: Vec<ApiFuturesPosition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFuturesAsset {
    pub asset: String,
    pub wallet_balance: Decimal,
    pub unrealized_profit: Decimal,
    pub margin_balance: Decimal,
    pub maint_margin: Decimal,
    pub available_balance: Decimal,
    #[serde(default)]
    pub update_time: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFuturesPosition {
    pub symbol: String,
    pub initial_margin: Decimal,
    pub maint_margin: Decimal,
    pub unrealized_profit: Decimal,
    pub entry_price: Decimal,
    pub leverage: String,
    pub position_side: String,
    pub position_amt: Decimal,
    #[serde(default)]
    pub update_time: i64,
}

/// Executed trade from `/api/v3/myTrades`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTrade {
    pub symbol: String,
    pub id: i64,
    pub order_id: i64,
    pub order_list_id: i64,
    pub price: Decimal,
    pub qty: Decimal,
    pub quote_qty: Decimal,
    pub commission: Decimal,
    pub commission_asset: String,
    pub time: i64,
    pub is_buyer: bool,
    pub is_maker: bool,
    pub is_best_match: bool,
}

impl From<ApiTrade> for TradeRow {
    fn from(t: ApiTrade) -> Self {
        Self {
            utc_time: utc_from_ms(t.time),
            symbol: t.symbol,
            id: t.id,
            order_id: t.order_id,
            order_list_id: t.order_list_id,
            price: t.price,
            qty: t.qty,
            quote_qty: t.quote_qty,
            commission: t.commission,
            commission_asset: t.commission_asset,
            time: t.time,
            is_buyer: t.is_buyer,
            is_maker: t.is_maker,
            is_best_match: t.is_best_match,
        }
    }
}

/// Order from `/api/v3/allOrders` or `/api/v3/openOrders`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiOrder {
    pub symbol: String,
    pub order_id: i64,
    pub order_list_id: i64,
    pub client_order_id: String,
    pub price: Decimal,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub cummulative_quote_qty: Decimal,
    pub status: String,
    pub time_in_force: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    pub stop_price: Decimal,
    pub iceberg_qty: Decimal,
    pub time: i64,
    pub update_time: i64,
    pub is_working: bool,
    pub orig_quote_order_qty: Decimal,
}

impl From<ApiOrder> for OrderRow {
    fn from(o: ApiOrder) -> Self {
        Self {
            utc_time: utc_from_ms(o.time),
            symbol: o.symbol,
            order_id: o.order_id,
            order_list_id: o.order_list_id,
            client_order_id: o.client_order_id,
            price: o.price,
            orig_qty: o.orig_qty,
            executed_qty: o.executed_qty,
            cummulative_quote_qty: o.cummulative_quote_qty,
            status: o.status,
            time_in_force: o.time_in_force,
            order_type: o.order_type,
            side: o.side,
            stop_price: o.stop_price,
            iceberg_qty: o.iceberg_qty,
            time: o.time,
            update_time: o.update_time,
            is_working: o.is_working,
            orig_quote_order_qty: o.orig_quote_order_qty,
        }
    }
}

/// Deposit from `/sapi/v1/capital/deposit/hisrec`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDeposit {
    pub amount: Decimal,
    pub coin: String,
    pub network: String,
    pub status: i64,
    pub address: String,
    #[serde(default)]
    pub address_tag: Option<String>,
    pub tx_id: String,
    pub insert_time: i64,
    #[serde(default)]
    pub transfer_type: Option<i64>,
    #[serde(default)]
    pub confirm_times: Option<String>,
}

/// Withdrawal from `/sapi/v1/capital/withdraw/history`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiWithdrawal {
    pub id: String,
    pub amount: Decimal,
    pub transaction_fee: Decimal,
    pub coin: String,
    pub status: i64,
    pub address: String,
    #[serde(default)]
    pub tx_id: Option<String>,
    /// `YYYY-MM-DD HH:MM:SS` in UTC.
    pub apply_time: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub transfer_type: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    snapshot_vos: Vec<ApiSnapshot>,
}

/// One daily account snapshot from `/sapi/v1/accountSnapshot`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSnapshot {
    #[serde(rename = "type")]
    pub snapshot_type: String,
    pub update_time: i64,
    pub data: ApiSnapshotData,
}

/// Snapshot payload. SPOT fills `balances`, FUTURES fills `assets` and `position`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSnapshotData {
    #[serde(default)]
    pub balances: Vec<ApiBalance>,
    #[serde(default)]
    pub assets: Vec<ApiSnapshotAsset>,
    #[serde(default)]
    pub position: Vec<ApiSnapshotPosition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSnapshotAsset {
    pub asset: String,
    pub margin_balance: Decimal,
    pub wallet_balance: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSnapshotPosition {
    pub symbol: String,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub position_amt: Decimal,
    pub un_realized_profit: Decimal,
}

/// One candle from `/api/v3/klines`.
#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

fn parse_kline_array(arr: &[serde_json::Value]) -> Option<Kline> {
    if arr.len() < 7 {
        return None;
    }
    Some(Kline {
        open_time: arr[0].as_i64()?,
        open: arr[1].as_str()?.parse().ok()?,
        high: arr[2].as_str()?.parse().ok()?,
        low: arr[3].as_str()?.parse().ok()?,
        close: arr[4].as_str()?.parse().ok()?,
        volume: arr[5].as_str()?.parse().ok()?,
        close_time: arr[6].as_i64()?,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKey {
    listen_key: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

// =============================================================================
// Exchange trait
// =============================================================================

/// Upstream account and market-data operations used by the reconcilers.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Latest price of every listed symbol.
    async fn tickers(&self) -> Result<Vec<TickerPrice>, UpstreamError>;

    async fn spot_account(&self) -> Result<SpotAccount, UpstreamError>;

    async fn futures_account(&self) -> Result<FuturesAccount, UpstreamError>;

    /// Trades of `symbol` from `start_time` (inclusive), oldest first.
    /// Without a start time the most recent `limit` trades are returned.
    async fn my_trades(&self, symbol: &str, start_time: Option<i64>, limit: u32)
    -> Result<Vec<ApiTrade>, UpstreamError>;

    /// Orders of `symbol`, with the same paging semantics as `my_trades`.
    async fn all_orders(&self, symbol: &str, start_time: Option<i64>, limit: u32)
    -> Result<Vec<ApiOrder>, UpstreamError>;

    /// Currently open orders over all symbols.
    async fn open_orders(&self) -> Result<Vec<ApiOrder>, UpstreamError>;

    /// Deposits inserted within `[start_time, end_time]`.
    async fn deposit_history(&self, start_time: i64, end_time: i64) -> Result<Vec<ApiDeposit>, UpstreamError>;

    /// Withdrawals applied within `[start_time, end_time]`.
    async fn withdraw_history(&self, start_time: i64, end_time: i64) -> Result<Vec<ApiWithdrawal>, UpstreamError>;

    /// Daily snapshots within `[start_time, end_time]`, at most 30 per call.
    async fn account_snapshots(
        &self,
        account_type: AccountType,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<ApiSnapshot>, UpstreamError>;

    /// Candles opening at or after `start_time`, oldest first.
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Kline>, UpstreamError>;

    /// Cheap call that refreshes the connection and its usage reading.
    async fn keepalive(&self) -> Result<(), UpstreamError>;

    /// Releases the connection's server-side resources.
    async fn close(&self) -> Result<(), UpstreamError>;

    /// Usage reported by the most recent response, if any.
    fn last_usage(&self) -> Option<WeightUsage>;
}

// =============================================================================
// Binance client
// =============================================================================

/// REST client for one Binance account (or public market data).
pub struct BinanceClient {
    http: Client,
    config: BinanceConfig,
    credentials: Option<Credentials>,
    usage: Mutex<Option<WeightUsage>>,
    listen_key: Mutex<Option<String>>,
    timestamp_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl BinanceClient {
    /// Creates a client. Without credentials only public endpoints work.
    pub fn new(config: BinanceConfig, credentials: Option<Credentials>) -> Result<Self, UpstreamError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            config,
            credentials,
            usage: Mutex::new(None),
            listen_key: Mutex::new(None),
            timestamp_fn: Arc::new(now_ms),
        })
    }

    /// Overrides the clock used for the `timestamp` parameter.
    pub fn with_timestamp_fn(mut self, timestamp_fn: Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.timestamp_fn = timestamp_fn;
        self
    }

    fn credentials(&self) -> Result<&Credentials, UpstreamError> {
        self.credentials
            .as_ref()
            .ok_or_else(|| UpstreamError::MissingCredentials("api key".to_string()))
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, UpstreamError> {
        let response = request.send().await?;
        if let Some(usage) = WeightUsage::from_headers(response.headers()) {
            *self.usage.lock() = Some(usage);
        }

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(err) => UpstreamError::Api {
                    status: status.as_u16(),
                    code: err.code,
                    msg: err.msg,
                },
                Err(_) => UpstreamError::Api {
                    status: status.as_u16(),
                    code: 0,
                    msg: body,
                },
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T, UpstreamError> {
        let url = format!("{}{}", self.config.spot_url, path);
        debug!(path, "GET");
        self.execute(self.http.get(url).query(params)).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        base_url: &str,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T, UpstreamError> {
        let credentials = self.credentials()?;
        params.push(("recvWindow", self.config.recv_window.to_string()));
        params.push(("timestamp", (self.timestamp_fn)().to_string()));

        let query = canonical_query(&params);
        let signature = sign_query(&credentials.api_secret, &query)?;
        let url = format!("{base_url}{path}?{query}&signature={signature}");
        debug!(path, %method, "signed request");

        self.execute(self.http.request(method, url).header("X-MBX-APIKEY", &credentials.api_key))
            .await
    }

    async fn user_stream<T: DeserializeOwned>(&self, method: Method, listen_key: Option<&str>) -> Result<T, UpstreamError> {
        let credentials = self.credentials()?;
        let mut url = format!("{}/api/v3/userDataStream", self.config.spot_url);
        if let Some(key) = listen_key {
            url = format!("{url}?listenKey={key}");
        }
        self.execute(self.http.request(method, url).header("X-MBX-APIKEY", &credentials.api_key))
            .await
    }

    async fn history_page<T: DeserializeOwned>(
        &self,
        path: &str,
        symbol: &str,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<T>, UpstreamError> {
        let mut params = vec![("symbol", symbol.to_string()), ("limit", limit.to_string())];
        if let Some(start) = start_time {
            params.push(("startTime", start.to_string()));
        }
        self.signed(Method::GET, &self.config.spot_url, path, params).await
    }
}

#[async_trait]
impl Exchange for BinanceClient {
    async fn tickers(&self) -> Result<Vec<TickerPrice>, UpstreamError> {
        self.public("/api/v3/ticker/price", &[]).await
    }

    async fn spot_account(&self) -> Result<SpotAccount, UpstreamError> {
        self.signed(Method::GET, &self.config.spot_url, "/api/v3/account", Vec::new())
            .await
    }

    async fn futures_account(&self) -> Result<FuturesAccount, UpstreamError> {
        self.signed(Method::GET, &self.config.futures_url, "/fapi/v2/account", Vec::new())
            .await
    }

    async fn my_trades(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ApiTrade>, UpstreamError> {
        self.history_page("/api/v3/myTrades", symbol, start_time, limit).await
    }

    async fn all_orders(
        &self,
        symbol: &str,
        start_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ApiOrder>, UpstreamError> {
        self.history_page("/api/v3/allOrders", symbol, start_time, limit).await
    }

    async fn open_orders(&self) -> Result<Vec<ApiOrder>, UpstreamError> {
        self.signed(Method::GET, &self.config.spot_url, "/api/v3/openOrders", Vec::new())
            .await
    }

    async fn deposit_history(&self, start_time: i64, end_time: i64) -> Result<Vec<ApiDeposit>, UpstreamError> {
        let params = vec![("startTime", start_time.to_string()), ("endTime", end_time.to_string())];
        self.signed(Method::GET, &self.config.spot_url, "/sapi/v1/capital/deposit/hisrec", params)
            .await
    }

    async fn withdraw_history(&self, start_time: i64, end_time: i64) -> Result<Vec<ApiWithdrawal>, UpstreamError> {
        let params = vec![("startTime", start_time.to_string()), ("endTime", end_time.to_string())];
        self.signed(Method::GET, &self.config.spot_url, "/sapi/v1/capital/withdraw/history", params)
            .await
    }

    async fn account_snapshots(
        &self,
        account_type: AccountType,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<ApiSnapshot>, UpstreamError> {
        let params = vec![
            ("type", account_type.as_str().to_string()),
            ("startTime", start_time.to_string()),
            ("endTime", end_time.to_string()),
            ("limit", MAX_SNAPSHOTS_PER_REQUEST.to_string()),
        ];
        let response: SnapshotResponse = self
            .signed(Method::GET, &self.config.spot_url, "/sapi/v1/accountSnapshot", params)
            .await?;
        if response.code != 200 {
            return Err(UpstreamError::Api {
                status: 200,
                code: response.code,
                msg: response.msg,
            });
        }
        Ok(response.snapshot_vos)
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Kline>, UpstreamError> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("startTime", start_time.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(end) = end_time {
            params.push(("endTime", end.to_string()));
        }
        let raw: Vec<Vec<serde_json::Value>> = self.public("/api/v3/klines", &params).await?;
        raw.iter()
            .map(|arr| {
                parse_kline_array(arr)
                    .ok_or_else(|| UpstreamError::InvalidResponse(format!("malformed kline for {symbol}")))
            })
            .collect()
    }

    async fn keepalive(&self) -> Result<(), UpstreamError> {
        if self.credentials.is_none() {
            let _: serde_json::Value = self.public("/api/v3/ping", &[]).await?;
            return Ok(());
        }

        let current = self.listen_key.lock().clone();
        match current {
            Some(key) => {
                let _: serde_json::Value = self.user_stream(Method::PUT, Some(&key)).await?;
            }
            None => {
                let created: ListenKey = self.user_stream(Method::POST, None).await?;
                *self.listen_key.lock() = Some(created.listen_key);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), UpstreamError> {
        let current = self.listen_key.lock().take();
        if let Some(key) = current {
            let _: serde_json::Value = self.user_stream(Method::DELETE, Some(&key)).await?;
            debug!("Closed user data stream");
        }
        Ok(())
    }

    fn last_usage(&self) -> Option<WeightUsage> {
        *self.usage.lock()
    }
}

fn canonical_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn sign_query(secret: &str, query: &str) -> Result<String, UpstreamError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| UpstreamError::InvalidResponse(format!("invalid API secret: {e}")))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
