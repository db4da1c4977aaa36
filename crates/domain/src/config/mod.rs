mod agent;
mod allocator;
mod context;
mod observability;
mod promotion;
mod quota_source;
mod sessions;

pub use agent::*;
pub use allocator::*;
pub use context::*;
pub use observability::*;
pub use promotion::*;
pub use quota_source::*;
pub use sessions::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub quota_source: QuotaSourceConfig,
    #[serde(default)]
    pub promotion: PromotionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where Slipway keeps everything it writes: the saved-ideas document,
/// runtime settings, and per-session scratch directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: d_state_path(),
        }
    }
}

impl StateConfig {
    pub fn ideas_path(&self) -> PathBuf {
        self.path.join("ideas.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.path.join("settings.json")
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.path.join("scratch")
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let mut error = |field: &str, message: String| {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            })
        };

        if self.agent.binary.trim().is_empty() {
            error("agent.binary", "agent binary must not be empty".into());
        }

        if self.sessions.queue_capacity == 0 {
            error(
                "sessions.queue_capacity",
                "queue capacity must be greater than 0".into(),
            );
        }

        if self.context.max_prompt_tokens == 0 {
            error(
                "context.max_prompt_tokens",
                "max_prompt_tokens must be greater than 0".into(),
            );
        }
        for (field, value) in [
            ("context.summarization_threshold", self.context.summarization_threshold),
            ("context.split_threshold", self.context.split_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                error(field, format!("{value} must be within (0, 1]"));
            }
        }
        if self.context.max_message_length == 0 {
            error(
                "context.max_message_length",
                "max_message_length must be greater than 0".into(),
            );
        }

        let t = self.allocator.warn_thresholds;
        if !(t[0] < t[1] && t[1] < t[2]) {
            error(
                "allocator.warn_thresholds",
                format!("thresholds must be strictly ascending, got {t:?}"),
            );
        }
        for (field, value) in [
            ("allocator.session_cap_percent_5h", self.allocator.session_cap_percent_5h),
            (
                "allocator.workspace_weekly_cap_percent",
                self.allocator.workspace_weekly_cap_percent,
            ),
            ("allocator.reserve_percent", self.allocator.reserve_percent),
            (
                "allocator.queue_auto_pause_percent",
                self.allocator.queue_auto_pause_percent,
            ),
        ] {
            if !(0.0..=100.0).contains(&value) {
                error(field, format!("{value} must be a percentage in [0, 100]"));
            }
        }
        if self.allocator.max_samples < 2 {
            error(
                "allocator.max_samples",
                "at least 2 samples are needed to compute a burn rate".into(),
            );
        }

        if self.quota_source.poll_interval_secs == 0 {
            error(
                "quota_source.poll_interval_secs",
                "poll interval must be greater than 0".into(),
            );
        }

        // Softer checks below.
        if self.context.split_threshold < self.context.summarization_threshold {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "context.split_threshold".into(),
                message: "split threshold is below the summarization threshold; \
                          splits will be suggested before summarizing"
                    .into(),
            });
        }

        if self.allocator.reserve_percent >= self.allocator.workspace_weekly_cap_percent {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "allocator.reserve_percent".into(),
                message: "reserve swallows the whole weekly cap; every turn will be refused".into(),
            });
        }

        if self.allocator.enabled && self.quota_source.url.is_none() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "quota_source.url".into(),
                message: "allocator enabled but no quota source configured; \
                          budget checks will never trigger"
                    .into(),
            });
        }

        errors
    }
}
