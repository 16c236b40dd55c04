//! On-disk ledger layout.
//!
//! ```text
//! {data_dir}/
//!   prices.csv
//!   balances_all_accounts.csv
//!   snapshots_daily_all_accounts.csv
//!   deposits_all_accounts.csv
//!   withdrawals_all_accounts.csv
//!   transfers_all_accounts.csv
//!   {account.dir}/balances_{account}.csv
//!   {account.dir}/trades_{account}.csv
//!   ...
//!   {klines.dir}/{interval}/history_{interval}_klines_{pair}.csv
//!   {klines.dir}/history_1d_klines_all_Assets.csv
//! ```

use std::path::{Path, PathBuf};

use crate::config::AccountConfig;

pub const PRICES_FILE: &str = "prices.csv";
pub const BALANCES_ALL_FILE: &str = "balances_all_accounts.csv";
pub const SNAPSHOTS_ALL_FILE: &str = "snapshots_daily_all_accounts.csv";
pub const DEPOSITS_ALL_FILE: &str = "deposits_all_accounts.csv";
pub const WITHDRAWALS_ALL_FILE: &str = "withdrawals_all_accounts.csv";
pub const TRANSFERS_ALL_FILE: &str = "transfers_all_accounts.csv";
pub const DAILY_KLINES_ALL_FILE: &str = "history_1d_klines_all_Assets.csv";

/// Ledger paths of one account.
#[derive(Debug, Clone)]
pub struct AccountPaths {
    dir: PathBuf,
    name: String,
}

impl AccountPaths {
    pub fn new(data_dir: &Path, account: &AccountConfig) -> Self {
        Self {
            dir: data_dir.join(&account.dir),
            name: account.name.clone(),
        }
    }

    fn file(&self, stem: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{stem}_{}{suffix}.csv", self.name))
    }

    pub fn balances(&self) -> PathBuf {
        self.file("balances", "")
    }

    pub fn balance_positions(&self) -> PathBuf {
        self.file("balances", "_positions")
    }

    pub fn balance_assets(&self) -> PathBuf {
        self.file("balances", "_assets")
    }

    pub fn trades(&self) -> PathBuf {
        self.file("trades", "")
    }

    pub fn orders(&self) -> PathBuf {
        self.file("orders", "")
    }

    pub fn open_orders(&self) -> PathBuf {
        self.file("open_orders", "")
    }

    pub fn deposits(&self) -> PathBuf {
        self.file("deposits", "")
    }

    pub fn withdrawals(&self) -> PathBuf {
        self.file("withdrawals", "")
    }

    pub fn snapshot_assets(&self) -> PathBuf {
        self.file("snapshot_daily", "_assets")
    }

    pub fn snapshot_balances(&self) -> PathBuf {
        self.file("snapshot_daily", "_balances")
    }

    pub fn snapshot_positions(&self) -> PathBuf {
        self.file("snapshot_daily", "_positions")
    }
}

/// Candle ledger of one pair and interval.
pub fn kline_path(klines_dir: &Path, interval: &str, pair: &str) -> PathBuf {
    klines_dir
        .join(interval)
        .join(format!("history_{interval}_klines_{pair}.csv"))
}

/// Pair encoded in a candle ledger file name, if it is one.
pub fn pair_from_kline_file(file_name: &str, interval: &str) -> Option<String> {
    file_name
        .strip_prefix(&format!("history_{interval}_klines_"))?
        .strip_suffix(".csv")
        .filter(|pair| !pair.is_empty())
        .map(str::to_string)
}
