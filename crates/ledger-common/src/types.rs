//! Ledger record types for the binance-ledger tools.
//!
//! CRITICAL: All prices, quantities and valuations use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.
//!
//! Column names follow the exchange's camelCase field names so a ledger can be
//! compared against raw API output. Derived columns are `refPrice` (price in the
//! reference asset), `value`, `UTCTime`, `account` and `type`.

use std::hash::Hash;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::time::utc_datetime;

/// Name of the synthetic portfolio-total row in balance and asset ledgers.
pub const PORTFOLIO_TOTAL: &str = "PortVal";

/// Name of the synthetic position-total row in futures position ledgers.
pub const POSITION_TOTAL: &str = "PosVal";

/// Exchange account type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    #[default]
    Spot,
    Futures,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Spot => "SPOT",
            AccountType::Futures => "FUTURES",
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sort direction a ledger is kept in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A row type stored in a keyed, time-ordered ledger.
///
/// After a merge no two rows share a `key()`; the most recently fetched row
/// wins. Rows are stably sorted by `sort_time()` in `ORDER`.
pub trait LedgerRecord: Serialize + DeserializeOwned + Clone {
    /// Unique key of the row.
    type Key: Eq + Hash;

    /// Sort direction of the ledger.
    const ORDER: SortOrder;

    fn key(&self) -> Self::Key;

    /// Epoch-millisecond timestamp used for ordering and watermarks.
    fn sort_time(&self) -> i64;
}

// =============================================================================
// Balances (point-in-time, not keyed)
// =============================================================================

/// One asset line of a SPOT balance snapshot, or the `PortVal` total row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotBalanceRow {
    pub asset: String,
    pub free: Option<Decimal>,
    pub locked: Option<Decimal>,
    pub ref_price: Option<Decimal>,
    pub free_value: Decimal,
    pub locked_value: Decimal,
    pub value: Decimal,
    pub update_time: i64,
    #[serde(rename = "UTCTime", with = "utc_datetime")]
    pub utc_time: DateTime<Utc>,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

/// Aggregate FUTURES account state, written as a single `PortVal` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesAccountRow {
    pub asset: String,
    pub total_initial_margin: Decimal,
    pub total_maint_margin: Decimal,
    pub total_wallet_balance: Decimal,
    pub total_unrealized_profit: Decimal,
    pub total_margin_balance: Decimal,
    pub total_position_initial_margin: Decimal,
    pub total_open_order_initial_margin: Decimal,
    pub available_balance: Decimal,
    pub max_withdraw_amount: Decimal,
    pub value: Decimal,
    pub update_time: i64,
    #[serde(rename = "UTCTime", with = "utc_datetime")]
    pub utc_time: DateTime<Utc>,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

/// One open FUTURES position, or the `PosVal` total row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesPositionRow {
    pub symbol: String,
    pub initial_margin: Decimal,
    pub maint_margin: Option<Decimal>,
    pub unrealized_profit: Decimal,
    pub entry_price: Option<Decimal>,
    pub leverage: Option<String>,
    pub position_side: Option<String>,
    pub position_amt: Option<Decimal>,
    pub ref_price: Option<Decimal>,
    pub value: Decimal,
    pub update_time: i64,
    #[serde(rename = "UTCTime", with = "utc_datetime")]
    pub utc_time: DateTime<Utc>,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

/// One FUTURES margin asset, or the `PortVal` total row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesAssetRow {
    pub asset: String,
    pub wallet_balance: Option<Decimal>,
    pub unrealized_profit: Option<Decimal>,
    pub margin_balance: Option<Decimal>,
    pub maint_margin: Option<Decimal>,
    pub available_balance: Option<Decimal>,
    pub ref_price: Option<Decimal>,
    pub value: Decimal,
    pub update_time: i64,
    #[serde(rename = "UTCTime", with = "utc_datetime")]
    pub utc_time: DateTime<Utc>,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

// =============================================================================
// Daily account snapshots
// =============================================================================

/// One asset of a daily SPOT snapshot, or the daily `PortVal` row.
///
/// The `PortVal` row leaves the quantity and price columns empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotAssetRow {
    pub asset: String,
    pub free: Option<Decimal>,
    pub locked: Option<Decimal>,
    pub ref_price: Option<Decimal>,
    pub free_value: Decimal,
    pub locked_value: Decimal,
    pub value: Decimal,
    pub update_time: i64,
    #[serde(rename = "UTCTime")]
    pub utc_date: NaiveDate,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

impl LedgerRecord for SnapshotAssetRow {
    type Key = (NaiveDate, String, String, AccountType);
    const ORDER: SortOrder = SortOrder::Descending;

    fn key(&self) -> Self::Key {
        (self.utc_date, self.asset.clone(), self.account.clone(), self.account_type)
    }

    fn sort_time(&self) -> i64 {
        self.update_time
    }
}

/// One asset of a daily FUTURES snapshot, or the daily `PortVal` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesSnapshotAssetRow {
    pub asset: String,
    pub margin_balance: Option<Decimal>,
    pub wallet_balance: Option<Decimal>,
    pub ref_price: Option<Decimal>,
    pub margin_value: Decimal,
    pub wallet_value: Decimal,
    pub pnl: Decimal,
    pub value: Decimal,
    pub update_time: i64,
    #[serde(rename = "UTCTime")]
    pub utc_date: NaiveDate,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

impl LedgerRecord for FuturesSnapshotAssetRow {
    type Key = (NaiveDate, String, String, AccountType);
    const ORDER: SortOrder = SortOrder::Descending;

    fn key(&self) -> Self::Key {
        (self.utc_date, self.asset.clone(), self.account.clone(), self.account_type)
    }

    fn sort_time(&self) -> i64 {
        self.update_time
    }
}

/// Daily portfolio total (`PortVal`) of either account type.
///
/// SPOT rows fill the free/locked columns, FUTURES rows fill margin/wallet/pnl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotBalanceRow {
    pub asset: String,
    pub free_value: Option<Decimal>,
    pub locked_value: Option<Decimal>,
    pub margin_value: Option<Decimal>,
    pub wallet_value: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub value: Decimal,
    pub update_time: i64,
    #[serde(rename = "UTCTime")]
    pub utc_date: NaiveDate,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

impl LedgerRecord for SnapshotBalanceRow {
    type Key = (NaiveDate, String, String, AccountType);
    const ORDER: SortOrder = SortOrder::Descending;

    fn key(&self) -> Self::Key {
        (self.utc_date, self.asset.clone(), self.account.clone(), self.account_type)
    }

    fn sort_time(&self) -> i64 {
        self.update_time
    }
}

/// One position of a daily FUTURES snapshot, or the daily `PosVal` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesSnapshotPositionRow {
    pub symbol: String,
    pub entry_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub position_amt: Option<Decimal>,
    pub un_realized_profit: Decimal,
    pub entry_value: Decimal,
    pub mark_value: Decimal,
    pub value_diff: Decimal,
    pub update_time: i64,
    #[serde(rename = "UTCTime")]
    pub utc_date: NaiveDate,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
}

impl LedgerRecord for FuturesSnapshotPositionRow {
    type Key = (NaiveDate, String, String, AccountType);
    const ORDER: SortOrder = SortOrder::Descending;

    fn key(&self) -> Self::Key {
        (self.utc_date, self.symbol.clone(), self.account.clone(), self.account_type)
    }

    fn sort_time(&self) -> i64 {
        self.update_time
    }
}

// =============================================================================
// Trades and orders
// =============================================================================

/// An executed SPOT trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRow {
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
    #[serde(rename = "UTCTime", with = "utc_datetime")]
    pub utc_time: DateTime<Utc>,
}

impl LedgerRecord for TradeRow {
    type Key = (String, i64);
    const ORDER: SortOrder = SortOrder::Descending;

    fn key(&self) -> Self::Key {
        (self.symbol.clone(), self.id)
    }

    fn sort_time(&self) -> i64 {
        self.time
    }
}

/// A SPOT order, historical or currently open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRow {
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
    #[serde(rename = "UTCTime", with = "utc_datetime")]
    pub utc_time: DateTime<Utc>,
}

impl LedgerRecord for OrderRow {
    type Key = (String, i64);
    const ORDER: SortOrder = SortOrder::Descending;

    fn key(&self) -> Self::Key {
        (self.symbol.clone(), self.order_id)
    }

    fn sort_time(&self) -> i64 {
        self.time
    }
}

// =============================================================================
// Transfers
// =============================================================================

/// Value of the `transaction` column for deposits.
pub const DEPOSIT: &str = "DEPOSIT";

/// Value of the `transaction` column for withdrawals.
pub const WITHDRAWAL: &str = "WITHDRAWAL";

/// A deposit into the account, valued at the deposit day's close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRow {
    pub amount: Decimal,
    pub coin: String,
    pub network: String,
    pub status: i64,
    pub address: String,
    pub address_tag: Option<String>,
    pub tx_id: String,
    pub insert_time: i64,
    pub transfer_type: Option<i64>,
    pub confirm_times: Option<String>,
    pub ref_price: Decimal,
    pub value: Decimal,
    #[serde(rename = "UTCTime", with = "utc_datetime")]
    pub utc_time: DateTime<Utc>,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub transaction: String,
}

impl LedgerRecord for DepositRow {
    type Key = String;
    const ORDER: SortOrder = SortOrder::Ascending;

    fn key(&self) -> Self::Key {
        self.tx_id.clone()
    }

    fn sort_time(&self) -> i64 {
        self.insert_time
    }
}

/// A withdrawal out of the account. `value` is negative and includes the fee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRow {
    pub id: String,
    pub amount: Decimal,
    pub transaction_fee: Decimal,
    pub coin: String,
    pub status: i64,
    pub address: String,
    pub tx_id: Option<String>,
    pub apply_time: String,
    pub network: Option<String>,
    pub transfer_type: Option<i64>,
    pub insert_time: i64,
    pub ref_price: Decimal,
    pub value: Decimal,
    #[serde(rename = "UTCTime", with = "utc_datetime")]
    pub utc_time: DateTime<Utc>,
    pub account: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub transaction: String,
}

impl LedgerRecord for WithdrawalRow {
    type Key = String;
    const ORDER: SortOrder = SortOrder::Ascending;

    fn key(&self) -> Self::Key {
        self.id.clone()
    }

    fn sort_time(&self) -> i64 {
        self.insert_time
    }
}

// =============================================================================
// Market data
// =============================================================================

/// One candle with optional technical indicator columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KlineRow {
    #[serde(with = "utc_datetime")]
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub open_time_ux: i64,
    pub rsi: Option<Decimal>,
    pub williams_r: Option<Decimal>,
    pub wrsi: Option<Decimal>,
    pub ema50: Option<Decimal>,
    pub ema100: Option<Decimal>,
    pub ema200: Option<Decimal>,
    pub dema50: Option<Decimal>,
    pub dema100: Option<Decimal>,
    pub dema200: Option<Decimal>,
}

impl LedgerRecord for KlineRow {
    type Key = i64;
    const ORDER: SortOrder = SortOrder::Ascending;

    fn key(&self) -> Self::Key {
        self.open_time_ux
    }

    fn sort_time(&self) -> i64 {
        self.open_time_ux
    }
}

/// A daily candle tagged with its trading pair, for the all-pairs file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairKlineRow {
    #[serde(with = "utc_datetime")]
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub open_time_ux: i64,
    pub pair: String,
}

impl PairKlineRow {
    pub fn from_kline(row: &KlineRow, pair: &str) -> Self {
        Self {
            open_time: row.open_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            open_time_ux: row.open_time_ux,
            pair: pair.to_string(),
        }
    }
}

impl LedgerRecord for PairKlineRow {
    type Key = (i64, String);
    const ORDER: SortOrder = SortOrder::Ascending;

    fn key(&self) -> Self::Key {
        (self.open_time_ux, self.pair.clone())
    }

    fn sort_time(&self) -> i64 {
        self.open_time_ux
    }
}

/// Latest ticker price of a trading pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub symbol: String,
    pub price: Decimal,
}
