use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent process
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the external agent CLI is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable name or path (resolved through `PATH`).
    #[serde(default = "d_binary")]
    pub binary: String,

    /// Model used for turns when neither the session nor a degradation
    /// step picks one. `None` leaves the agent's own default.
    #[serde(default)]
    pub default_model: Option<String>,

    /// Model used for context summarization runs.
    #[serde(default = "d_summarization_model")]
    pub summarization_model: String,

    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Hard wall-clock limit for a single turn, in seconds.
    #[serde(default = "d_turn_timeout_sec")]
    pub turn_timeout_sec: u64,

    /// Maximum stderr bytes retained for error reporting.
    #[serde(default = "d_stderr_max_bytes")]
    pub stderr_max_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: d_binary(),
            default_model: None,
            summarization_model: d_summarization_model(),
            extra_args: Vec::new(),
            turn_timeout_sec: d_turn_timeout_sec(),
            stderr_max_bytes: d_stderr_max_bytes(),
        }
    }
}

fn d_binary() -> String {
    "claude".into()
}
fn d_summarization_model() -> String {
    "haiku".into()
}
fn d_turn_timeout_sec() -> u64 {
    1800
}
fn d_stderr_max_bytes() -> usize {
    16 * 1024
}
