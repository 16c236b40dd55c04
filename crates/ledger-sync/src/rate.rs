//! Rate governor for the exchange's request-weight budget.
//!
//! Every response reports how much of a rolling weight budget has been used.
//! Before each budget-consuming call the reconciler asks the governor to
//! `check` the connection; if the last reported usage is above the threshold
//! the governor sleeps with a growing delay, pings the connection to refresh
//! the usage reading, and only returns once usage is back under the threshold.

use std::time::Duration;

use reqwest::header::HeaderMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::binance::Exchange;

/// Errors raised by the rate governor.
#[derive(Debug, Error)]
pub enum RateError {
    #[error("Rate budget still exhausted after {attempts} back-off attempts ({used}/{limit} on {header})")]
    Exhausted {
        attempts: u32,
        used: u64,
        limit: u64,
        header: &'static str,
    },
}

/// A metered budget reported in response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightDimension {
    /// `x-mbx-used-weight`
    RequestWeight,
    /// `x-mbx-used-weight-1m`
    RequestWeight1m,
    /// `x-sapi-used-ip-weight-1m`
    SapiIpWeight1m,
}

impl WeightDimension {
    /// Lookup order; a later dimension overrides an earlier one.
    const PRECEDENCE: [WeightDimension; 3] = [
        WeightDimension::RequestWeight,
        WeightDimension::RequestWeight1m,
        WeightDimension::SapiIpWeight1m,
    ];

    pub fn header(&self) -> &'static str {
        match self {
            WeightDimension::RequestWeight => "x-mbx-used-weight",
            WeightDimension::RequestWeight1m => "x-mbx-used-weight-1m",
            WeightDimension::SapiIpWeight1m => "x-sapi-used-ip-weight-1m",
        }
    }

    /// Budget limit of the dimension.
    pub fn limit(&self) -> u64 {
        match self {
            WeightDimension::RequestWeight | WeightDimension::RequestWeight1m => 1200,
            WeightDimension::SapiIpWeight1m => 12000,
        }
    }
}

/// Usage reported by the most recent response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightUsage {
    pub dimension: WeightDimension,
    pub used: u64,
}

impl WeightUsage {
    pub fn new(dimension: WeightDimension, used: u64) -> Self {
        Self { dimension, used }
    }

    /// Extracts usage from response headers. The most specific dimension wins.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        WeightDimension::PRECEDENCE
            .iter()
            .filter_map(|dim| {
                headers
                    .get(dim.header())
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(|used| WeightUsage::new(*dim, used))
            })
            .last()
    }

    fn exceeds(&self, threshold: f64) -> bool {
        self.used as f64 > self.dimension.limit() as f64 * threshold
    }
}

/// Configuration for the rate governor.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Fraction of the dimension limit above which the governor backs off.
    pub threshold: f64,
    /// Back-off unit; attempt `n` sleeps `n × backoff_unit`.
    pub backoff_unit: Duration,
    /// Back-off attempts allowed in one `check` before giving up.
    pub max_backoff_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            backoff_unit: Duration::from_secs(60),
            max_backoff_attempts: 10,
        }
    }
}

/// Per-connection rate governor.
#[derive(Debug)]
pub struct RateGovernor {
    config: RateLimitConfig,
    attempts: u32,
    last_usage: Option<WeightUsage>,
}

impl RateGovernor {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            attempts: 0,
            last_usage: None,
        }
    }

    /// Last usage seen by `check`.
    pub fn last_usage(&self) -> Option<WeightUsage> {
        self.last_usage
    }

    /// Blocks until the connection's usage is under the threshold.
    ///
    /// Returns the current usage (0 if nothing has been observed yet).
    pub async fn check(&mut self, exchange: &dyn Exchange) -> Result<u64, RateError> {
        let Some(mut usage) = exchange.last_usage() else {
            return Ok(0);
        };

        while usage.exceeds(self.config.threshold) {
            self.attempts += 1;
            if self.attempts > self.config.max_backoff_attempts {
                let attempts = self.attempts - 1;
                self.attempts = 0;
                return Err(RateError::Exhausted {
                    attempts,
                    used: usage.used,
                    limit: usage.dimension.limit(),
                    header: usage.dimension.header(),
                });
            }

            let delay = self.config.backoff_unit * self.attempts;
            warn!(
                used = usage.used,
                limit = usage.dimension.limit(),
                header = usage.dimension.header(),
                attempt = self.attempts,
                "Rate budget above threshold, backing off for {:?}",
                delay
            );
            tokio::time::sleep(delay).await;

            if let Err(e) = exchange.keepalive().await {
                warn!(error = %e, "Keep-alive failed during back-off");
            }
            if let Some(latest) = exchange.last_usage() {
                usage = latest;
            }
        }

        if self.attempts > 0 {
            debug!(used = usage.used, attempts = self.attempts, "Rate budget recovered");
        }
        self.attempts = 0;
        self.last_usage = Some(usage);
        Ok(usage.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockExchange;
    use reqwest::header::HeaderValue;

    fn config(max_attempts: u32) -> RateLimitConfig {
        RateLimitConfig {
            threshold: 0.75,
            backoff_unit: Duration::from_secs(60),
            max_backoff_attempts: max_attempts,
        }
    }

    #[test]
    fn test_usage_from_headers_prefers_sapi() {
        let mut headers = HeaderMap::new();
        headers.insert("x-mbx-used-weight", HeaderValue::from_static("10"));
        headers.insert("x-mbx-used-weight-1m", HeaderValue::from_static("20"));
        headers.insert("x-sapi-used-ip-weight-1m", HeaderValue::from_static("300"));

        let usage = WeightUsage::from_headers(&headers).unwrap();
        assert_eq!(usage.dimension, WeightDimension::SapiIpWeight1m);
        assert_eq!(usage.used, 300);
    }

    #[test]
    fn test_usage_from_headers_minute_over_plain() {
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT", HeaderValue::from_static("10"));
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("20"));

        let usage = WeightUsage::from_headers(&headers).unwrap();
        assert_eq!(usage, WeightUsage::new(WeightDimension::RequestWeight1m, 20));
        assert!(WeightUsage::from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn test_threshold() {
        assert!(!WeightUsage::new(WeightDimension::RequestWeight1m, 900).exceeds(0.75));
        assert!(WeightUsage::new(WeightDimension::RequestWeight1m, 901).exceeds(0.75));
        assert!(!WeightUsage::new(WeightDimension::SapiIpWeight1m, 8000).exceeds(0.75));
    }

    #[tokio::test]
    async fn test_no_usage_observed_returns_zero() {
        let exchange = MockExchange::default();
        let mut governor = RateGovernor::new(config(3));

        assert_eq!(governor.check(&exchange).await.unwrap(), 0);
        assert_eq!(exchange.keepalive_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backs_off_once_then_proceeds() {
        let exchange = MockExchange::default();
        exchange.set_usage(WeightUsage::new(WeightDimension::RequestWeight1m, 960));
        exchange.script_keepalive_usage(vec![WeightUsage::new(WeightDimension::RequestWeight1m, 600)]);
        let mut governor = RateGovernor::new(config(3));

        let started = tokio::time::Instant::now();
        let used = governor.check(&exchange).await.unwrap();

        assert_eq!(used, 600);
        assert_eq!(exchange.keepalive_calls(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_linearly() {
        let exchange = MockExchange::default();
        exchange.set_usage(WeightUsage::new(WeightDimension::RequestWeight, 1100));
        exchange.script_keepalive_usage(vec![
            WeightUsage::new(WeightDimension::RequestWeight, 1000),
            WeightUsage::new(WeightDimension::RequestWeight, 100),
        ]);
        let mut governor = RateGovernor::new(config(5));

        let started = tokio::time::Instant::now();
        governor.check(&exchange).await.unwrap();

        // 60s then 120s
        assert_eq!(started.elapsed(), Duration::from_secs(180));
        assert_eq!(exchange.keepalive_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dimension_can_change_after_keepalive() {
        let exchange = MockExchange::default();
        exchange.set_usage(WeightUsage::new(WeightDimension::RequestWeight1m, 1000));
        // 8500 is under 0.75 × 12000 on the SAPI dimension
        exchange.script_keepalive_usage(vec![WeightUsage::new(WeightDimension::SapiIpWeight1m, 8500)]);
        let mut governor = RateGovernor::new(config(3));

        assert_eq!(governor.check(&exchange).await.unwrap(), 8500);
        assert_eq!(governor.last_usage().unwrap().dimension, WeightDimension::SapiIpWeight1m);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_attempts() {
        let exchange = MockExchange::default();
        exchange.set_usage(WeightUsage::new(WeightDimension::RequestWeight1m, 1200));
        let mut governor = RateGovernor::new(config(2));

        let err = governor.check(&exchange).await.unwrap_err();
        assert!(matches!(err, RateError::Exhausted { attempts: 2, used: 1200, .. }));
        assert_eq!(exchange.keepalive_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_failure_is_swallowed() {
        let exchange = MockExchange::default();
        exchange.set_usage(WeightUsage::new(WeightDimension::RequestWeight1m, 950));
        exchange.fail_keepalive();
        let mut governor = RateGovernor::new(config(1));

        // Usage never refreshes, so the single allowed attempt is used up.
        assert!(governor.check(&exchange).await.is_err());
        assert_eq!(exchange.keepalive_calls(), 1);
    }
}
