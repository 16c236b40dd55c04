//! Balance ticker notifications.
//!
//! Sends a one-line status per account, and per account group, to a Telegram
//! chat: cash, portfolio value and profit against the configured investment.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AccountConfig, AccountGroup};
use crate::reconcile::balances::BalanceSummary;

/// Telegram Bot API base URL.
pub const DEFAULT_TELEGRAM_URL: &str = "https://api.telegram.org";

/// Errors that can occur while sending a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Missing bot token: environment variable {0} is not set")]
    MissingToken(String),
}

/// Configuration for the Telegram sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Environment variable holding the bot token.
    pub token_env: String,
    pub api_url: String,
    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            token_env: "TELEGRAM_BOT_TOKEN".to_string(),
            api_url: DEFAULT_TELEGRAM_URL.to_string(),
            timeout_secs: 5,
        }
    }
}

/// A chat message sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), NotifyError>;
}

/// Sends messages through the Telegram Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl TelegramNotifier {
    pub fn from_config(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NotifyError::MissingToken(config.token_env.clone()))?;
        Self::new(&config.api_url, token, Duration::from_secs(config.timeout_secs))
    }

    pub fn new(api_url: &str, token: String, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.token);
        let payload = serde_json::json!({ "chat_id": chat_id, "text": text });

        self.client
            .post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

/// Profit in percent of `investment`; 0 without an investment.
pub fn profit_pct(portfolio_value: Decimal, investment: Decimal) -> Decimal {
    if investment.is_zero() {
        return Decimal::ZERO;
    }
    (portfolio_value - investment) / investment * dec!(100)
}

/// `c=<cash> b=<portfolio> p=<profit>% <pseudo>`, lower-cased.
pub fn account_message(summary: &BalanceSummary, investment: Decimal, pseudo: &str) -> String {
    let profit = profit_pct(summary.portfolio_value, investment);
    format!(
        "c={:.1} b={:.1} p={:.2}% {}",
        summary.cash.round_dp(1),
        summary.portfolio_value.round_dp(1),
        profit.round_dp(2),
        pseudo
    )
    .to_lowercase()
}

/// Group line with summed cash, value and investment, rounded coarser.
pub fn group_message(members: &[(&BalanceSummary, Decimal)], pseudo: &str) -> String {
    let cash: Decimal = members.iter().map(|(s, _)| s.cash).sum();
    let value: Decimal = members.iter().map(|(s, _)| s.portfolio_value).sum();
    let investment: Decimal = members.iter().map(|(_, inv)| *inv).sum();
    let profit = profit_pct(value, investment);
    format!(
        "c={:.0} b={:.0} p={:.1}% {}",
        cash.round_dp(0),
        value.round_dp(0),
        profit.round_dp(1),
        pseudo
    )
    .to_lowercase()
}

/// Sends account and group tickers. Returns the number of messages sent.
///
/// Accounts without a chat id or pseudo are skipped; send failures are logged.
pub async fn send_tickers(
    notifier: &dyn Notifier,
    summaries: &[(&AccountConfig, BalanceSummary)],
    groups: &[AccountGroup],
) -> usize {
    let mut sent = 0;

    for (account, summary) in summaries {
        let (Some(chat_id), Some(pseudo)) = (&account.chat_id, &account.chat_pseudo) else {
            continue;
        };
        let text = account_message(summary, account.investment, pseudo);
        match notifier.send(chat_id, &text).await {
            Ok(()) => sent += 1,
            Err(e) => warn!(account = %account.name, error = %e, "Failed to send ticker"),
        }
    }

    for group in groups {
        let members: Vec<(&BalanceSummary, Decimal)> = group
            .members
            .iter()
            .filter_map(|name| {
                let found = summaries.iter().find(|(a, _)| &a.name == name);
                if found.is_none() {
                    warn!(group = %group.name, account = %name, "No balance for group member");
                }
                found.map(|(a, s)| (s, a.investment))
            })
            .collect();
        if members.is_empty() {
            continue;
        }

        let text = group_message(&members, &group.chat_pseudo);
        match notifier.send(&group.chat_id, &text).await {
            Ok(()) => sent += 1,
            Err(e) => warn!(group = %group.name, error = %e, "Failed to send group ticker"),
        }
    }

    info!(sent, "Sent balance tickers");
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::test_support::account;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use ledger_common::AccountType;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, chat_id: &str, text: &str) -> Result<(), NotifyError> {
            self.sent.lock().push((chat_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn summary(cash: Decimal, value: Decimal) -> BalanceSummary {
        BalanceSummary {
            cash,
            portfolio_value: value,
        }
    }

    #[test]
    fn test_account_message() {
        let text = account_message(&summary(dec!(100.04), dec!(1100)), dec!(1000), "Main");
        assert_eq!(text, "c=100.0 b=1100.0 p=10.00% main");
    }

    #[test]
    fn test_zero_investment_profit() {
        assert_eq!(profit_pct(dec!(500), dec!(0)), dec!(0));
        let text = account_message(&summary(dec!(1), dec!(2)), dec!(0), "x");
        assert!(text.contains("p=0.00%"));
    }

    #[test]
    fn test_group_message_sums_members() {
        let a = summary(dec!(100), dec!(1500));
        let b = summary(dec!(50.4), dec!(600));
        let text = group_message(&[(&a, dec!(1000)), (&b, dec!(1000))], "ALL");
        // value 2100 vs 2000 invested
        assert_eq!(text, "c=150 b=2100 p=5.0% all");
    }

    #[tokio::test]
    async fn test_send_tickers_accounts_and_groups() {
        let mut main = account("main", AccountType::Spot);
        main.chat_id = Some("42".to_string());
        main.investment = dec!(1000);
        let mut silent = account("silent", AccountType::Futures);
        silent.chat_pseudo = None;

        let groups = vec![AccountGroup {
            name: "all".to_string(),
            chat_id: "99".to_string(),
            chat_pseudo: "All".to_string(),
            members: vec!["main".to_string(), "silent".to_string(), "gone".to_string()],
        }];
        let summaries = vec![
            (&main, summary(dec!(10), dec!(1100))),
            (&silent, summary(dec!(5), dec!(100))),
        ];

        let notifier = RecordingNotifier::default();
        let sent = send_tickers(&notifier, &summaries, &groups).await;

        assert_eq!(sent, 2);
        let messages = notifier.sent.lock();
        assert_eq!(messages[0], ("42".to_string(), "c=10.0 b=1100.0 p=10.00% main".to_string()));
        assert_eq!(messages[1].0, "99");
        assert!(messages[1].1.starts_with("c=15 b=1200"));
    }

    #[tokio::test]
    async fn test_telegram_send() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/botTOKEN/sendMessage")
                    .json_body(serde_json::json!({"chat_id": "42", "text": "hello"}));
                then.status(200).body(r#"{"ok":true}"#);
            })
            .await;

        let notifier = TelegramNotifier::new(&server.base_url(), "TOKEN".to_string(), Duration::from_secs(5)).unwrap();
        notifier.send("42", "hello").await.unwrap();
        mock.assert_async().await;
    }
}
