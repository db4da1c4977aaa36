use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context window
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Context-window thresholds. Runtime-mutable through the settings store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Prompt budget used when the session's model has no entry in
    /// `model_windows`.
    #[serde(default = "d_max_prompt_tokens")]
    pub max_prompt_tokens: u64,
    /// Utilization (0..1) at which summarization kicks in.
    #[serde(default = "d_summarization_threshold")]
    pub summarization_threshold: f64,
    /// Utilization (0..1) at which the user is told to start a new session.
    #[serde(default = "d_split_threshold")]
    pub split_threshold: f64,
    /// Recent messages (per role) kept verbatim by summarization.
    #[serde(default = "d_verbatim_recent_count")]
    pub verbatim_recent_count: usize,
    /// Per-message cap when replaying history into a prompt.
    #[serde(default = "d_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "d_summarization_timeout_sec")]
    pub summarization_timeout_sec: u64,
    /// Oldest summaries beyond this count are dropped.
    #[serde(default = "d_max_summaries")]
    pub max_summaries: usize,
    /// Prompt budget per model id.
    #[serde(default)]
    pub model_windows: HashMap<String, u64>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_prompt_tokens: d_max_prompt_tokens(),
            summarization_threshold: d_summarization_threshold(),
            split_threshold: d_split_threshold(),
            verbatim_recent_count: d_verbatim_recent_count(),
            max_message_length: d_max_message_length(),
            summarization_timeout_sec: d_summarization_timeout_sec(),
            max_summaries: d_max_summaries(),
            model_windows: HashMap::new(),
        }
    }
}

impl ContextConfig {
    /// Prompt budget for `model`, falling back to `max_prompt_tokens`.
    pub fn window_for(&self, model: Option<&str>) -> u64 {
        model
            .and_then(|m| self.model_windows.get(m).copied())
            .unwrap_or(self.max_prompt_tokens)
    }

    /// Overwrite every field present in `patch`.
    pub fn apply(&mut self, patch: ContextSettingsPatch) {
        if let Some(v) = patch.max_prompt_tokens {
            self.max_prompt_tokens = v;
        }
        if let Some(v) = patch.summarization_threshold {
            self.summarization_threshold = v;
        }
        if let Some(v) = patch.split_threshold {
            self.split_threshold = v;
        }
        if let Some(v) = patch.verbatim_recent_count {
            self.verbatim_recent_count = v;
        }
        if let Some(v) = patch.max_message_length {
            self.max_message_length = v;
        }
    }
}

/// Partial update for [`ContextConfig`]; absent fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSettingsPatch {
    #[serde(default)]
    pub max_prompt_tokens: Option<u64>,
    #[serde(default)]
    pub summarization_threshold: Option<f64>,
    #[serde(default)]
    pub split_threshold: Option<f64>,
    #[serde(default)]
    pub verbatim_recent_count: Option<usize>,
    #[serde(default)]
    pub max_message_length: Option<usize>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_prompt_tokens() -> u64 {
    150_000
}
fn d_summarization_threshold() -> f64 {
    0.75
}
fn d_split_threshold() -> f64 {
    0.9
}
fn d_verbatim_recent_count() -> usize {
    5
}
fn d_max_message_length() -> usize {
    4_000
}
fn d_summarization_timeout_sec() -> u64 {
    60
}
fn d_max_summaries() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_for_prefers_model_entry() {
        let mut cfg = ContextConfig::default();
        cfg.model_windows.insert("haiku".into(), 50_000);
        assert_eq!(cfg.window_for(Some("haiku")), 50_000);
        assert_eq!(cfg.window_for(Some("other")), 150_000);
        assert_eq!(cfg.window_for(None), 150_000);
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let mut cfg = ContextConfig::default();
        cfg.apply(ContextSettingsPatch {
            split_threshold: Some(0.95),
            ..Default::default()
        });
        assert!((cfg.split_threshold - 0.95).abs() < f64::EPSILON);
        assert!((cfg.summarization_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.verbatim_recent_count, 5);
    }
}
