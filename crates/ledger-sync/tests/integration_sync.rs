//! End-to-end runs against a mocked Binance REST API.
//!
//! These tests drive the public API only:
//! - Config is parsed from TOML
//! - The aggregator runs over real `BinanceClient` connections
//! - Ledgers and combined files land on disk

use std::path::Path;
use std::sync::Arc;

use httpmock::Method::GET;
use httpmock::MockServer;
use rust_decimal_macros::dec;

use ledger_common::ledger;
use ledger_common::{PORTFOLIO_TOTAL, PriceRow, SpotBalanceRow};
use ledger_sync::aggregator::{Aggregator, BinanceFactory, ExchangeFactory};
use ledger_sync::binance::{BinanceClient, Credentials, Exchange, UpstreamError};
use ledger_sync::config::{AccountConfig, ModuleFlags, Stream, SyncConfig};
use ledger_sync::layout::{BALANCES_ALL_FILE, PRICES_FILE};
use ledger_sync::reconcile::StreamStatus;

/// Connects every account with fixed test credentials.
struct StaticKeyFactory {
    config: ledger_sync::binance::BinanceConfig,
}

impl ExchangeFactory for StaticKeyFactory {
    fn connect(&self, account: Option<&AccountConfig>) -> Result<Arc<dyn Exchange>, UpstreamError> {
        let credentials = account.map(|a| Credentials {
            api_key: format!("{}-key", a.name),
            api_secret: format!("{}-secret", a.name),
        });
        Ok(Arc::new(BinanceClient::new(self.config.clone(), credentials)?))
    }
}

fn config_for(server: &MockServer, data_dir: &Path, streams: &[Stream]) -> SyncConfig {
    let toml = format!(
        r#"
[general]
data_dir = "{data_dir}"

[[accounts]]
name = "main"
dir = "main"
type = "SPOT"
api_key_env = "LEDGER_SYNC_IT_UNSET_KEY"
api_secret_env = "LEDGER_SYNC_IT_UNSET_SECRET"

[upstream]
spot_url = "{url}"
futures_url = "{url}"
pair_delay_ms = 0
retry_delay_ms = 0
"#,
        data_dir = data_dir.display(),
        url = server.base_url(),
    );
    let mut config = SyncConfig::from_toml_str(&toml).unwrap();
    config.modules = ModuleFlags::only(streams);
    config
}

async fn mock_tickers(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/v3/ticker/price");
            then.status(200).body(
                r#"[{"symbol":"BTCUSDT","price":"50000.00000000"},{"symbol":"ETHBTC","price":"0.06000000"}]"#,
            );
        })
        .await;
}

#[tokio::test]
async fn test_balances_and_prices_run() {
    let server = MockServer::start_async().await;
    mock_tickers(&server).await;
    let account = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/v3/account")
                .header("X-MBX-APIKEY", "main-key");
            then.status(200).body(
                r#"{"updateTime":1622505599000,"balances":[
                    {"asset":"USDT","free":"100.00000000","locked":"0.00000000"},
                    {"asset":"BTC","free":"0.00100000","locked":"0.00000000"},
                    {"asset":"ETH","free":"0.00000000","locked":"0.00000000"}]}"#,
            );
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path(), &[Stream::Balances, Stream::Prices]);
    let factory = StaticKeyFactory {
        config: config.binance.clone(),
    };

    let report = Aggregator::new(&config, &factory).run().await.unwrap();
    account.assert_async().await;

    assert_eq!(report.get("main", Stream::Balances).unwrap().status, StreamStatus::Persisted);
    assert_eq!(report.get("", Stream::Prices).unwrap().new_records, 2);
    assert_eq!(report.failure_count(), 0);

    let rows: Vec<SpotBalanceRow> = ledger::read(&dir.path().join(BALANCES_ALL_FILE)).unwrap().unwrap();
    let assets: Vec<&str> = rows.iter().map(|r| r.asset.as_str()).collect();
    assert_eq!(assets, vec!["BTC", "USDT", PORTFOLIO_TOTAL]);
    assert_eq!(rows[0].value, dec!(50));
    assert_eq!(rows[2].value, dec!(150));
    assert_eq!(rows[2].free_value, dec!(50));

    let prices: Vec<PriceRow> = ledger::read(&dir.path().join(PRICES_FILE)).unwrap().unwrap();
    assert_eq!(prices.len(), 2);
}

#[tokio::test]
async fn test_missing_credentials_do_not_stop_market_data() {
    let server = MockServer::start_async().await;
    mock_tickers(&server).await;

    let dir = tempfile::tempdir().unwrap();
    let config = config_for(&server, dir.path(), &[Stream::Balances, Stream::Prices]);
    let factory = BinanceFactory::new(config.binance.clone());

    let report = Aggregator::new(&config, &factory).run().await.unwrap();

    let balances = report.get("main", Stream::Balances).unwrap();
    assert_eq!(balances.status, StreamStatus::Failed);
    assert!(balances.failed_partitions[0].contains("LEDGER_SYNC_IT_UNSET_KEY"));
    assert!(!dir.path().join("main").exists());
    assert_eq!(report.get("", Stream::Prices).unwrap().status, StreamStatus::Persisted);
}

#[test]
fn test_sample_config_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/ledger-sync.toml");
    let config = SyncConfig::from_file(&path).unwrap();

    assert_eq!(config.accounts.len(), 2);
    assert_eq!(config.account_groups[0].members, vec!["main", "futures"]);
    assert!(config.modules.is_enabled(Stream::Trades));
    assert!(!config.modules.is_enabled(Stream::Klines));
    assert_eq!(config.klines_dir(), Path::new("data").join("klines"));
}
