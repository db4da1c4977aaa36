use serde::{Deserialize, Serialize};

/// Events parsed from an agent process's structured output stream.
///
/// Every stream produced by an invoker ends with exactly one
/// [`AgentEvent::Exit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// An assistant text chunk.
    Text { content: String },

    /// The agent invoked a tool; `content` is a short rendering of the input.
    ToolUse { tool_name: String, content: String },

    /// Final result record for the invocation.
    Result {
        /// Agent-side conversation id, usable for `--resume`.
        session_id: Option<String>,
        usage: Option<TokenUsage>,
        model: Option<String>,
    },

    /// The agent reported an error mid-stream.
    Error { content: String },

    /// The process finished.
    Exit { outcome: InvokeOutcome },
}

/// Token usage reported by the agent for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Total prompt-side tokens, including cache reads and writes.
    pub fn total_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }
}

/// How an agent invocation ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl InvokeOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            exit_code: Some(0),
        }
    }

    pub fn failed(error: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            exit_code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_input_sums_cache_fields() {
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 99,
            cache_creation_input_tokens: 5,
            cache_read_input_tokens: 100,
        };
        assert_eq!(usage.total_input(), 115);
    }

    #[test]
    fn exit_event_serializes_with_tag() {
        let ev = AgentEvent::Exit {
            outcome: InvokeOutcome::failed("killed", None),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["outcome"]["success"], false);
        assert_eq!(json["outcome"]["error"], "killed");
    }
}
