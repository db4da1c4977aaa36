use serde::{Deserialize, Serialize};

/// Upstream usage endpoint polled for utilization samples.
///
/// The endpoint must answer with a JSON body carrying `five_hour` and
/// `seven_day` objects, each with a `utilization` fraction. When `url` is
/// `None` no samples are taken and the allocator never trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSourceConfig {
    #[serde(default)]
    pub url: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "d_token_env")]
    pub token_env: String,
    #[serde(default = "d_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "d_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for QuotaSourceConfig {
    fn default() -> Self {
        Self {
            url: None,
            token_env: d_token_env(),
            poll_interval_secs: d_poll_interval_secs(),
            timeout_secs: d_timeout_secs(),
        }
    }
}

fn d_token_env() -> String {
    "SW_QUOTA_TOKEN".into()
}
fn d_poll_interval_secs() -> u64 {
    60
}
fn d_timeout_secs() -> u64 {
    10
}
