//! Shared types and storage for the binance-ledger tools.
//!
//! This crate contains:
//! - Ledger record types (balances, snapshots, trades, orders, transfers, klines)
//! - Epoch-millisecond time helpers
//! - The CSV ledger store

pub mod ledger;
pub mod time;
pub mod types;

pub use ledger::{LedgerError, WriteMode, merge_files, merge_records};
pub use types::*;
