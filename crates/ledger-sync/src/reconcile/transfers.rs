//! Deposits and withdrawals.
//!
//! Both are fetched in 90-day windows from the ledger's watermark (or the
//! exchange launch date) up to now, valued with the daily close of the
//! transfer day, and merged into the account's ledger.

use async_trait::async_trait;
use ledger_common::ledger::{self, WriteMode};
use ledger_common::time::{parse_utc_ms, utc_from_ms};
use ledger_common::{AccountType, DEPOSIT, DepositRow, LedgerRecord, WITHDRAWAL, WithdrawalRow, merge_records};
use tracing::{info, warn};

use super::{Session, StreamContext, StreamReport, SyncError, WindowSource, fetch_windows};
use crate::binance::{ApiDeposit, ApiWithdrawal, Exchange, UpstreamError};
use crate::valuation::Valuer;
use crate::watermark::{self, TRANSFER_ORIGIN_MS};

/// Longest time range the transfer history endpoints accept (90 days).
pub const TRANSFER_WINDOW_MS: i64 = 7_776_000_000;

struct Deposits;

#[async_trait]
impl WindowSource for Deposits {
    type Item = ApiDeposit;

    fn label(&self) -> &'static str {
        "deposits"
    }

    async fn fetch(&self, exchange: &dyn Exchange, start: i64, end: i64) -> Result<Vec<ApiDeposit>, UpstreamError> {
        exchange.deposit_history(start, end).await
    }
}

struct Withdrawals;

#[async_trait]
impl WindowSource for Withdrawals {
    type Item = ApiWithdrawal;

    fn label(&self) -> &'static str {
        "withdrawals"
    }

    async fn fetch(&self, exchange: &dyn Exchange, start: i64, end: i64) -> Result<Vec<ApiWithdrawal>, UpstreamError> {
        exchange.withdraw_history(start, end).await
    }
}

pub async fn reconcile_deposits(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
) -> Result<StreamReport, SyncError> {
    if ctx.account.account_type == AccountType::Futures {
        return Ok(StreamReport::unsupported());
    }

    let path = ctx.paths.deposits();
    let existing: Vec<DepositRow> = ledger::read(&path)?.unwrap_or_default();
    let start = watermark::resolve(&existing, TRANSFER_ORIGIN_MS);

    let fetch = fetch_windows(session, ctx.config, &Deposits, start, ctx.now_ms, TRANSFER_WINDOW_MS).await?;
    let failed = stopped_window(fetch.stopped_at);
    if fetch.items.is_empty() {
        info!(account = %ctx.account.name, stream = "deposits", "No new records");
        return Ok(StreamReport::up_to_date(failed));
    }

    let mut valuer = Valuer::load(session, &ctx.config.reference_asset).await?;
    let mut rows = Vec::with_capacity(fetch.items.len());
    for d in fetch.items {
        let price = valuer.price_at(session, &d.coin, d.insert_time).await?;
        rows.push(DepositRow {
            value: d.amount * price,
            ref_price: price,
            utc_time: utc_from_ms(d.insert_time),
            amount: d.amount,
            coin: d.coin,
            network: d.network,
            status: d.status,
            address: d.address,
            address_tag: d.address_tag,
            tx_id: d.tx_id,
            insert_time: d.insert_time,
            transfer_type: d.transfer_type,
            confirm_times: d.confirm_times,
            account: ctx.account.name.clone(),
            account_type: ctx.account.account_type,
            transaction: DEPOSIT.to_string(),
        });
    }

    persist(ctx, &path, existing, rows, failed, "deposits")
}

pub async fn reconcile_withdrawals(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
) -> Result<StreamReport, SyncError> {
    if ctx.account.account_type == AccountType::Futures {
        return Ok(StreamReport::unsupported());
    }

    let path = ctx.paths.withdrawals();
    let existing: Vec<WithdrawalRow> = ledger::read(&path)?.unwrap_or_default();
    let start = watermark::resolve(&existing, TRANSFER_ORIGIN_MS);

    let fetch = fetch_windows(session, ctx.config, &Withdrawals, start, ctx.now_ms, TRANSFER_WINDOW_MS).await?;
    let failed = stopped_window(fetch.stopped_at);
    if fetch.items.is_empty() {
        info!(account = %ctx.account.name, stream = "withdrawals", "No new records");
        return Ok(StreamReport::up_to_date(failed));
    }

    let mut valuer = Valuer::load(session, &ctx.config.reference_asset).await?;
    let mut rows = Vec::with_capacity(fetch.items.len());
    for w in fetch.items {
        let Some(insert_time) = parse_utc_ms(&w.apply_time) else {
            warn!(account = %ctx.account.name, id = %w.id, apply_time = %w.apply_time, "Unparseable applyTime, skipping withdrawal");
            continue;
        };
        let price = valuer.price_at(session, &w.coin, insert_time).await?;
        rows.push(WithdrawalRow {
            value: -(w.amount + w.transaction_fee) * price,
            ref_price: price,
            utc_time: utc_from_ms(insert_time),
            insert_time,
            id: w.id,
            amount: w.amount,
            transaction_fee: w.transaction_fee,
            coin: w.coin,
            status: w.status,
            address: w.address,
            tx_id: w.tx_id,
            apply_time: w.apply_time,
            network: w.network,
            transfer_type: w.transfer_type,
            account: ctx.account.name.clone(),
            account_type: ctx.account.account_type,
            transaction: WITHDRAWAL.to_string(),
        });
    }
    if rows.is_empty() {
        return Ok(StreamReport::up_to_date(failed));
    }

    persist(ctx, &path, existing, rows, failed, "withdrawals")
}

fn stopped_window(stopped_at: Option<i64>) -> Vec<String> {
    stopped_at
        .map(|start| vec![format!("window from {}", utc_from_ms(start).format("%Y-%m-%d"))])
        .unwrap_or_default()
}

fn persist<T: LedgerRecord>(
    ctx: &StreamContext<'_>,
    path: &std::path::Path,
    existing: Vec<T>,
    fetched: Vec<T>,
    failed: Vec<String>,
    stream: &'static str,
) -> Result<StreamReport, SyncError> {
    let new_records = fetched.len();
    let merged = merge_records(existing, fetched);
    ledger::write(path, &merged, WriteMode::Overwrite)?;

    info!(account = %ctx.account.name, stream, new_records, total = merged.len(), "Ledger updated");
    Ok(StreamReport::persisted(new_records, failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::Kline;
    use crate::mock::MockExchange;
    use crate::reconcile::StreamStatus;
    use crate::reconcile::test_support::{account, config, paths, rate};
    use ledger_common::time::{DAY_MS, day_start_ms};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn deposit(tx_id: &str, coin: &str, amount: Decimal, insert_time: i64) -> ApiDeposit {
        ApiDeposit {
            amount,
            coin: coin.to_string(),
            network: coin.to_string(),
            status: 1,
            address: "addr".to_string(),
            address_tag: None,
            tx_id: tx_id.to_string(),
            insert_time,
            transfer_type: Some(0),
            confirm_times: Some("1/1".to_string()),
        }
    }

    fn daily_candle(ts: i64, close: Decimal) -> Kline {
        let open_time = day_start_ms(ts);
        Kline {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            close_time: open_time + DAY_MS - 1,
        }
    }

    #[tokio::test]
    async fn test_deposits_across_windows() {
        let t1 = TRANSFER_ORIGIN_MS + 10 * DAY_MS;
        let t2 = TRANSFER_ORIGIN_MS + 100 * DAY_MS;
        let t3 = TRANSFER_ORIGIN_MS + 101 * DAY_MS;

        let mut exchange = MockExchange::default().with_tickers(&[("BTCUSDT", dec!(60000))]);
        exchange.deposits = vec![
            deposit("c", "BTC", dec!(0.5), t3),
            deposit("a", "BTC", dec!(1), t1),
            deposit("b", "USDT", dec!(250), t2),
        ];
        exchange.klines.insert(
            ("BTCUSDT".to_string(), "1d".to_string()),
            vec![daily_candle(t1, dec!(2500)), daily_candle(t3, dec!(4000))],
        );

        let acct = account("main", AccountType::Spot);
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path(), &acct);
        let cfg = config();
        let ctx = StreamContext {
            account: &acct,
            paths: &paths,
            config: &cfg,
            now_ms: TRANSFER_ORIGIN_MS + 200 * DAY_MS,
        };

        let mut session = Session::new(&exchange, rate());
        let report = reconcile_deposits(&mut session, &ctx).await.unwrap();
        assert_eq!(report.status, StreamStatus::Persisted);
        assert_eq!(exchange.call_count("deposit_history"), 3);

        let rows: Vec<DepositRow> = ledger::read(&paths.deposits()).unwrap().unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.tx_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(rows[0].value, dec!(2500));
        assert_eq!(rows[1].ref_price, dec!(1));
        assert_eq!(rows[1].value, dec!(250));
        assert_eq!(rows[2].value, dec!(2000));
        assert!(rows.iter().all(|r| r.transaction == DEPOSIT));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let t1 = TRANSFER_ORIGIN_MS + DAY_MS;
        let mut exchange = MockExchange::default();
        exchange.deposits = vec![deposit("a", "LUNA", dec!(3), t1)];

        let acct = account("main", AccountType::Spot);
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path(), &acct);
        let cfg = config();
        let ctx = StreamContext {
            account: &acct,
            paths: &paths,
            config: &cfg,
            now_ms: TRANSFER_ORIGIN_MS + 30 * DAY_MS,
        };

        let mut session = Session::new(&exchange, rate());
        reconcile_deposits(&mut session, &ctx).await.unwrap();
        let before = std::fs::read(paths.deposits()).unwrap();
        let rows: Vec<DepositRow> = ledger::read(&paths.deposits()).unwrap().unwrap();
        // No price for an unlisted coin.
        assert_eq!(rows[0].value, dec!(0));

        let report = reconcile_deposits(&mut session, &ctx).await.unwrap();
        assert_eq!(report.status, StreamStatus::UpToDate);
        assert_eq!(std::fs::read(paths.deposits()).unwrap(), before);
        // Resumed exactly one millisecond after the stored deposit.
        assert!(exchange.calls().contains(&format!("deposit_history {}", t1 + 1)));
    }

    #[tokio::test]
    async fn test_withdrawal_value_includes_fee() {
        let apply = "2021-05-02 10:00:00";
        let apply_ms = parse_utc_ms(apply).unwrap();
        let mut exchange = MockExchange::default().with_tickers(&[("XYZUSDT", dec!(3))]);
        exchange.withdrawals = vec![
            ApiWithdrawal {
                id: "w1".to_string(),
                amount: dec!(10),
                transaction_fee: dec!(0.1),
                coin: "XYZ".to_string(),
                status: 6,
                address: "addr".to_string(),
                tx_id: Some("0xabc".to_string()),
                apply_time: apply.to_string(),
                network: Some("ETH".to_string()),
                transfer_type: Some(0),
            },
        ];
        exchange.klines.insert(
            ("XYZUSDT".to_string(), "1d".to_string()),
            vec![daily_candle(apply_ms, dec!(2))],
        );

        let acct = account("main", AccountType::Spot);
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path(), &acct);
        let cfg = config();
        let ctx = StreamContext {
            account: &acct,
            paths: &paths,
            config: &cfg,
            now_ms: apply_ms + DAY_MS,
        };

        let mut session = Session::new(&exchange, rate());
        reconcile_withdrawals(&mut session, &ctx).await.unwrap();

        let rows: Vec<WithdrawalRow> = ledger::read(&paths.withdrawals()).unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, dec!(-20.2));
        assert_eq!(rows[0].insert_time, apply_ms);
        assert_eq!(rows[0].transaction, WITHDRAWAL);
    }

    #[tokio::test]
    async fn test_failed_window_keeps_earlier_windows() {
        let t1 = TRANSFER_ORIGIN_MS + DAY_MS;
        let mut exchange = MockExchange::default();
        exchange.deposits = vec![deposit("a", "USDT", dec!(5), t1)];

        let acct = account("main", AccountType::Spot);
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path(), &acct);
        let cfg = config();
        let ctx = StreamContext {
            account: &acct,
            paths: &paths,
            config: &cfg,
            now_ms: TRANSFER_ORIGIN_MS + 120 * DAY_MS,
        };

        let second_window = TRANSFER_ORIGIN_MS + TRANSFER_WINDOW_MS + 1;
        exchange.fail_next(&format!("deposit_history {second_window}"), 10);

        let mut session = Session::new(&exchange, rate());
        let report = reconcile_deposits(&mut session, &ctx).await.unwrap();

        assert_eq!(report.status, StreamStatus::Persisted);
        assert_eq!(report.failed_partitions.len(), 1);
        let rows: Vec<DepositRow> = ledger::read(&paths.deposits()).unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        // 1 success + 1 failure + 2 retries
        assert_eq!(exchange.call_count("deposit_history"), 4);
    }

    #[tokio::test]
    async fn test_window_retried_after_transient_failure() {
        let second_window = TRANSFER_ORIGIN_MS + TRANSFER_WINDOW_MS + 1;
        let mut exchange = MockExchange::default();
        exchange.deposits = vec![
            deposit("a", "USDT", dec!(5), TRANSFER_ORIGIN_MS + DAY_MS),
            deposit("b", "USDT", dec!(7), second_window + DAY_MS),
        ];

        let acct = account("main", AccountType::Spot);
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path(), &acct);
        let cfg = config();
        let ctx = StreamContext {
            account: &acct,
            paths: &paths,
            config: &cfg,
            now_ms: TRANSFER_ORIGIN_MS + 120 * DAY_MS,
        };

        exchange.fail_next(&format!("deposit_history {second_window}"), 1);

        let mut session = Session::new(&exchange, rate());
        let report = reconcile_deposits(&mut session, &ctx).await.unwrap();

        assert_eq!(report.status, StreamStatus::Persisted);
        assert_eq!(report.new_records, 2);
        assert!(report.failed_partitions.is_empty());
        let rows: Vec<DepositRow> = ledger::read(&paths.deposits()).unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(exchange.call_count(&format!("deposit_history {second_window}")), 2);
    }

    #[tokio::test]
    async fn test_futures_transfers_unsupported() {
        let exchange = MockExchange::default();
        let acct = account("fut", AccountType::Futures);
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path(), &acct);
        let cfg = config();
        let ctx = StreamContext {
            account: &acct,
            paths: &paths,
            config: &cfg,
            now_ms: TRANSFER_ORIGIN_MS + DAY_MS,
        };

        let mut session = Session::new(&exchange, rate());
        assert_eq!(
            reconcile_deposits(&mut session, &ctx).await.unwrap().status,
            StreamStatus::Unsupported
        );
        assert_eq!(
            reconcile_withdrawals(&mut session, &ctx).await.unwrap().status,
            StreamStatus::Unsupported
        );
        assert!(exchange.calls().is_empty());
    }
}
