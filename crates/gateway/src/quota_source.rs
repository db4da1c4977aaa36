//! Upstream quota readings.
//!
//! [`HttpQuotaSource`] polls the configured usage endpoint. The body is
//! expected to look like
//! `{"five_hour": {"utilization": 0.42}, "seven_day": {"utilization": 0.10}}`
//! with utilization as a fraction of the rolling limit. Either window may
//! be `null` while the account has no usage data yet.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use sw_domain::config::QuotaSourceConfig;
use sw_domain::error::{Error, Result};

/// One reading of rolling utilization, as fractions in `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaReading {
    pub five_hour: f64,
    pub seven_day: f64,
}

#[async_trait]
pub trait QuotaSource: Send + Sync {
    /// `Ok(None)` when the source has nothing to report.
    async fn query_quota(&self) -> Result<Option<QuotaReading>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP source
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct UsageWindow {
    utilization: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    five_hour: Option<UsageWindow>,
    seven_day: Option<UsageWindow>,
}

impl UsageResponse {
    fn into_reading(self) -> Option<QuotaReading> {
        let five = self.five_hour.and_then(|w| w.utilization);
        let seven = self.seven_day.and_then(|w| w.utilization);
        match (five, seven) {
            (None, None) => None,
            (five, seven) => Some(QuotaReading {
                five_hour: five.unwrap_or(0.0),
                seven_day: seven.unwrap_or(0.0),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpQuotaSource {
    http: Client,
    url: String,
    token: Option<String>,
}

impl HttpQuotaSource {
    /// Build a source from config. Returns `Ok(None)` when no URL is set.
    pub fn from_config(cfg: &QuotaSourceConfig) -> Result<Option<Self>> {
        let url = match &cfg.url {
            Some(u) => u.clone(),
            None => return Ok(None),
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("building quota HTTP client: {e}")))?;
        let token = std::env::var(&cfg.token_env).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            tracing::warn!(
                env = %cfg.token_env,
                "quota source token env var unset; requests will be unauthenticated"
            );
        }
        Ok(Some(Self { http, url, token }))
    }
}

#[async_trait]
impl QuotaSource for HttpQuotaSource {
    async fn query_quota(&self) -> Result<Option<QuotaReading>> {
        let start = Instant::now();
        let mut rb = self.http.get(&self.url);
        if let Some(token) = &self.token {
            rb = rb.bearer_auth(token);
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| Error::Transient(format!("quota request failed: {e}")))?;
        let status = resp.status();
        tracing::debug!(
            status = status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "quota source polled"
        );

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Transient(format!(
                "quota endpoint returned {status}: {body}"
            )));
        }

        let body: UsageResponse = resp
            .json()
            .await
            .map_err(|e| Error::Transient(format!("quota response unreadable: {e}")))?;
        Ok(body.into_reading())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Option<QuotaReading> {
        serde_json::from_str::<UsageResponse>(json)
            .unwrap()
            .into_reading()
    }

    #[test]
    fn full_response() {
        let r = parse(r#"{"five_hour":{"utilization":0.42,"resets_at":"x"},"seven_day":{"utilization":0.1}}"#)
            .unwrap();
        assert!((r.five_hour - 0.42).abs() < 1e-9);
        assert!((r.seven_day - 0.1).abs() < 1e-9);
    }

    #[test]
    fn empty_windows_mean_no_reading() {
        assert!(parse(r#"{"five_hour":null,"seven_day":null}"#).is_none());
        assert!(parse(r#"{}"#).is_none());
    }

    #[test]
    fn missing_window_defaults_to_zero() {
        let r = parse(r#"{"five_hour":{"utilization":0.3}}"#).unwrap();
        assert_eq!(r.seven_day, 0.0);
    }

    #[test]
    fn no_url_means_no_source() {
        let cfg = QuotaSourceConfig::default();
        assert!(HttpQuotaSource::from_config(&cfg).unwrap().is_none());
    }
}
