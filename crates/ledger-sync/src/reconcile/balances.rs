//! Point-in-time balances.
//!
//! Not incremental: every run reads the live account and either replaces the
//! balance ledger or appends a new block of rows to it, depending on the
//! configured write mode. Breakdown ledgers of FUTURES accounts (positions,
//! assets) are always replaced.

use ledger_common::ledger::{self, WriteMode};
use ledger_common::time::utc_from_ms;
use ledger_common::{
    AccountType, FuturesAccountRow, FuturesAssetRow, FuturesPositionRow, PORTFOLIO_TOTAL, POSITION_TOTAL,
    SpotBalanceRow,
};
use rust_decimal::Decimal;
use tracing::info;

use super::{Session, StreamContext, StreamReport, SyncError};
use crate::binance::{FuturesAccount, SpotAccount};
use crate::valuation::Valuer;

/// Headline numbers of an account, used for ticker messages.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BalanceSummary {
    /// Reference-asset cash available.
    pub cash: Decimal,
    /// Total account value in the reference asset.
    pub portfolio_value: Decimal,
}

/// Balance rows of one account type.
#[derive(Debug, Clone)]
pub enum BalanceSheet {
    Spot(Vec<SpotBalanceRow>),
    Futures {
        account: FuturesAccountRow,
        positions: Vec<FuturesPositionRow>,
        assets: Vec<FuturesAssetRow>,
    },
}

impl BalanceSheet {
    fn row_count(&self) -> usize {
        match self {
            BalanceSheet::Spot(rows) => rows.len(),
            BalanceSheet::Futures { positions, assets, .. } => 1 + positions.len() + assets.len(),
        }
    }
}

/// Reads live balances and values them, without touching any ledger.
pub async fn read_balances(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
) -> Result<(BalanceSheet, BalanceSummary), SyncError> {
    let valuer = Valuer::load(session, &ctx.config.reference_asset).await?;
    session.throttle().await?;

    match ctx.account.account_type {
        AccountType::Spot => {
            let account = session.exchange().spot_account().await?;
            let (rows, summary) = spot_sheet(&account, &valuer, ctx);
            Ok((BalanceSheet::Spot(rows), summary))
        }
        AccountType::Futures => {
            let account = session.exchange().futures_account().await?;
            Ok(futures_sheet(&account, &valuer, ctx))
        }
    }
}

/// Reads live balances and writes the balance ledgers.
pub async fn reconcile_balances(
    session: &mut Session<'_>,
    ctx: &StreamContext<'_>,
) -> Result<(StreamReport, BalanceSummary), SyncError> {
    let (sheet, summary) = read_balances(session, ctx).await?;
    let rows = sheet.row_count();

    match &sheet {
        BalanceSheet::Spot(rows) => {
            ledger::write(&ctx.paths.balances(), rows, ctx.config.balance_write_mode)?;
        }
        BalanceSheet::Futures {
            account,
            positions,
            assets,
        } => {
            ledger::write(
                &ctx.paths.balances(),
                std::slice::from_ref(account),
                ctx.config.balance_write_mode,
            )?;
            ledger::write(&ctx.paths.balance_positions(), positions, WriteMode::Overwrite)?;
            ledger::write(&ctx.paths.balance_assets(), assets, WriteMode::Overwrite)?;
        }
    }

    info!(
        account = %ctx.account.name,
        rows,
        cash = %summary.cash,
        value = %summary.portfolio_value,
        "Balances written"
    );
    Ok((StreamReport::persisted(rows, Vec::new()), summary))
}

/// Values a SPOT account. Zero balances are dropped; rows are sorted by asset
/// and followed by the `PortVal` total.
pub fn spot_sheet(
    account: &SpotAccount,
    valuer: &Valuer,
    ctx: &StreamContext<'_>,
) -> (Vec<SpotBalanceRow>, BalanceSummary) {
    let utc_time = utc_from_ms(ctx.now_ms);
    let mut rows: Vec<SpotBalanceRow> = account
        .balances
        .iter()
        .filter(|b| !(b.free.is_zero() && b.locked.is_zero()))
        .map(|b| {
            let price = valuer.live_price(&b.asset);
            let free_value = b.free * price;
            let locked_value = b.locked * price;
            SpotBalanceRow {
                asset: b.asset.clone(),
                free: Some(b.free),
                locked: Some(b.locked),
                ref_price: Some(price),
                free_value,
                locked_value,
                value: free_value + locked_value,
                update_time: account.update_time,
                utc_time,
                account: ctx.account.name.clone(),
                account_type: AccountType::Spot,
            }
        })
        .collect();
    rows.sort_by(|a, b| a.asset.cmp(&b.asset));

    let reference_free = rows
        .iter()
        .find(|r| r.asset == valuer.reference())
        .map_or(Decimal::ZERO, |r| r.free_value);
    let free_total: Decimal = rows.iter().map(|r| r.free_value).sum();
    let locked_total: Decimal = rows.iter().map(|r| r.locked_value).sum();
    let value_total: Decimal = rows.iter().map(|r| r.value).sum();

    rows.push(SpotBalanceRow {
        asset: PORTFOLIO_TOTAL.to_string(),
        free: None,
        locked: None,
        ref_price: None,
        free_value: free_total - reference_free,
        locked_value: locked_total,
        value: value_total,
        update_time: account.update_time,
        utc_time,
        account: ctx.account.name.clone(),
        account_type: AccountType::Spot,
    });

    let summary = BalanceSummary {
        cash: reference_free,
        portfolio_value: value_total,
    };
    (rows, summary)
}

/// Values a FUTURES account: the aggregate row, open positions and margin
/// assets, each breakdown followed by its total row.
pub fn futures_sheet(
    account: &FuturesAccount,
    valuer: &Valuer,
    ctx: &StreamContext<'_>,
) -> (BalanceSheet, BalanceSummary) {
    let utc_time = utc_from_ms(ctx.now_ms);
    let name = &ctx.account.name;
    let value = account.total_wallet_balance + account.total_unrealized_profit;

    let account_row = FuturesAccountRow {
        asset: PORTFOLIO_TOTAL.to_string(),
        total_initial_margin: account.total_initial_margin,
        total_maint_margin: account.total_maint_margin,
        total_wallet_balance: account.total_wallet_balance,
        total_unrealized_profit: account.total_unrealized_profit,
        total_margin_balance: account.total_margin_balance,
        total_position_initial_margin: account.total_position_initial_margin,
        total_open_order_initial_margin: account.total_open_order_initial_margin,
        available_balance: account.available_balance,
        max_withdraw_amount: account.max_withdraw_amount,
        value,
        update_time: account.update_time,
        utc_time,
        account: name.clone(),
        account_type: AccountType::Futures,
    };

    let mut positions: Vec<FuturesPositionRow> = account
        .positions
        .iter()
        .filter(|p| !p.initial_margin.is_zero())
        .map(|p| {
            let price = valuer.pair_price(&p.symbol);
            FuturesPositionRow {
                symbol: p.symbol.clone(),
                initial_margin: p.initial_margin,
                maint_margin: Some(p.maint_margin),
                unrealized_profit: p.unrealized_profit,
                entry_price: Some(p.entry_price),
                leverage: Some(p.leverage.clone()),
                position_side: Some(p.position_side.clone()),
                position_amt: Some(p.position_amt),
                ref_price: Some(price),
                value: p.position_amt * price,
                update_time: p.update_time,
                utc_time: utc_from_ms(p.update_time),
                account: name.clone(),
                account_type: AccountType::Futures,
            }
        })
        .collect();
    positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    positions.push(FuturesPositionRow {
        symbol: POSITION_TOTAL.to_string(),
        initial_margin: positions.iter().map(|p| p.initial_margin).sum(),
        maint_margin: None,
        unrealized_profit: positions.iter().map(|p| p.unrealized_profit).sum(),
        entry_price: None,
        leverage: None,
        position_side: None,
        position_amt: None,
        ref_price: None,
        value: positions.iter().map(|p| p.value).sum(),
        update_time: account.update_time,
        utc_time,
        account: name.clone(),
        account_type: AccountType::Futures,
    });

    let mut assets: Vec<FuturesAssetRow> = account
        .assets
        .iter()
        .filter(|a| a.update_time != 0)
        .map(|a| {
            let price = valuer.live_price(&a.asset);
            FuturesAssetRow {
                asset: a.asset.clone(),
                wallet_balance: Some(a.wallet_balance),
                unrealized_profit: Some(a.unrealized_profit),
                margin_balance: Some(a.margin_balance),
                maint_margin: Some(a.maint_margin),
                available_balance: Some(a.available_balance),
                ref_price: Some(price),
                value: a.margin_balance * price,
                update_time: a.update_time,
                utc_time,
                account: name.clone(),
                account_type: AccountType::Futures,
            }
        })
        .collect();
    assets.sort_by(|a, b| a.asset.cmp(&b.asset));
    assets.push(FuturesAssetRow {
        asset: PORTFOLIO_TOTAL.to_string(),
        wallet_balance: None,
        unrealized_profit: None,
        margin_balance: None,
        maint_margin: None,
        available_balance: None,
        ref_price: None,
        value: assets.iter().map(|a| a.value).sum(),
        update_time: account.update_time,
        utc_time,
        account: name.clone(),
        account_type: AccountType::Futures,
    });

    let summary = BalanceSummary {
        cash: account.total_margin_balance - account.total_maint_margin,
        portfolio_value: value,
    };
    (
        BalanceSheet::Futures {
            account: account_row,
            positions,
            assets,
        },
        summary,
    )
}
