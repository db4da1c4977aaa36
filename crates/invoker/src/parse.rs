//! Parser for the agent CLI's `--output-format stream-json` lines.
//!
//! Each stdout line is one JSON record. The records that matter:
//! - `{"type":"system","subtype":"init","model":..,"session_id":..}`
//! - `{"type":"assistant","message":{"content":[{"type":"text"|"tool_use",..}]}}`
//! - `{"type":"result","is_error":..,"result":..,"session_id":..,"usage":{..}}`
//!
//! Anything else (tool results echoed back as `user` records, unknown
//! types, non-JSON noise) is skipped.

use serde_json::Value;

use sw_domain::stream::{AgentEvent, TokenUsage};

/// Longest tool-input rendering forwarded as an activity event.
const TOOL_INPUT_MAX_CHARS: usize = 200;

/// Stateful line parser; remembers the model announced at init and the
/// last error the agent reported.
#[derive(Debug, Default)]
pub struct StreamParser {
    model: Option<String>,
    last_error: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent error text seen in the stream.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<AgentEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                tracing::trace!(line, "skipping non-JSON agent output");
                return Vec::new();
            }
        };

        match record.get("type").and_then(Value::as_str) {
            Some("system") => {
                if let Some(model) = record.get("model").and_then(Value::as_str) {
                    self.model = Some(model.to_owned());
                }
                Vec::new()
            }
            Some("assistant") => self.parse_assistant(&record),
            Some("result") => self.parse_result(&record),
            Some("error") => {
                let content = record
                    .get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .map(value_text)
                    .unwrap_or_else(|| "unknown agent error".into());
                self.last_error = Some(content.clone());
                vec![AgentEvent::Error { content }]
            }
            _ => Vec::new(),
        }
    }

    fn parse_assistant(&mut self, record: &Value) -> Vec<AgentEvent> {
        let message = match record.get("message") {
            Some(m) => m,
            None => return Vec::new(),
        };
        if let Some(model) = message.get("model").and_then(Value::as_str) {
            self.model = Some(model.to_owned());
        }
        let blocks = match message.get("content").and_then(Value::as_array) {
            Some(b) => b,
            None => return Vec::new(),
        };

        blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .filter(|t| !t.is_empty())
                    .map(|t| AgentEvent::Text {
                        content: t.to_owned(),
                    }),
                Some("tool_use") => Some(AgentEvent::ToolUse {
                    tool_name: block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("tool")
                        .to_owned(),
                    content: block
                        .get("input")
                        .map(|i| truncate(&value_text(i), TOOL_INPUT_MAX_CHARS))
                        .unwrap_or_default(),
                }),
                _ => None,
            })
            .collect()
    }

    fn parse_result(&mut self, record: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let is_error = record
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            let content = record
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| {
                    record
                        .get("subtype")
                        .and_then(Value::as_str)
                        .map(|s| format!("agent error: {s}"))
                })
                .unwrap_or_else(|| "agent reported an error".into());
            self.last_error = Some(content.clone());
            events.push(AgentEvent::Error { content });
        }

        let usage = record
            .get("usage")
            .and_then(|u| serde_json::from_value::<TokenUsage>(u.clone()).ok());
        events.push(AgentEvent::Result {
            session_id: record
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            usage,
            model: self.model.clone(),
        });
        events
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_owned(),
    }
}
