use serde::Serialize;

/// Structured trace events emitted across all Slipway crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        session_id: String,
    },
    SessionDeleted {
        session_id: String,
        killed_processes: usize,
    },
    SessionSaved {
        session_id: String,
        messages: usize,
    },
    SessionPromoted {
        session_id: String,
        repo_path: String,
        transferred_history: bool,
    },
    TurnStarted {
        session_id: String,
        turn_id: String,
        mode: String,
        resumed: bool,
        prompt_chars: usize,
    },
    TurnFinished {
        session_id: String,
        turn_id: String,
        success: bool,
        duration_ms: u64,
        input_tokens: Option<u64>,
    },
    MessageQueued {
        session_id: String,
        queue_len: usize,
    },
    MessageDropped {
        session_id: String,
        capacity: usize,
    },
    SummarizationFinished {
        session_id: String,
        covered_messages: usize,
        token_estimate: u64,
        success: bool,
        duration_ms: u64,
    },
    UtilizationSampled {
        five_hour_pct: f64,
        seven_day_pct: f64,
        samples: usize,
    },
    BudgetDenied {
        session_id: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "sw_event");
    }
}
