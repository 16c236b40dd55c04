//! ledger-sync: Incremental Binance account history into CSV ledgers.
//!
//! For every configured account, each enabled stream (balances, trades,
//! orders, open orders, deposits, withdrawals, daily snapshots) is extended
//! from its on-disk watermark, valued in the reference asset and merged into
//! the account's ledger. Public market data (prices, klines) and balance
//! tickers are optional extra jobs.

pub mod aggregator;
pub mod binance;
pub mod config;
pub mod indicators;
pub mod layout;
pub mod notify;
pub mod rate;
pub mod reconcile;
pub mod symbols;
pub mod valuation;
pub mod watermark;

#[cfg(test)]
mod mock;

pub use aggregator::{Aggregator, BinanceFactory, ExchangeFactory, RunReport};
pub use config::{Stream, SyncConfig};
