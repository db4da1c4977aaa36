//! Events pushed to session subscribers.

use serde::Serialize;

use sw_sessions::{ChatStatus, Message, QueuedMessage};

use super::context::ContextState;
use super::quota::BudgetCheck;

/// One event on a session's stream. Every variant names its session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A message was added to the history.
    Message { session_id: String, message: Message },

    /// Streamed assistant text appended to `message_id`.
    Chunk {
        session_id: String,
        message_id: String,
        content: String,
    },

    Status {
        session_id: String,
        chat_status: ChatStatus,
    },

    /// The agent used a tool.
    Activity {
        session_id: String,
        tool_name: String,
        content: String,
    },

    /// `message_id` will receive no more chunks.
    #[serde(rename = "message-complete")]
    MessageComplete {
        session_id: String,
        message_id: String,
    },

    Error {
        session_id: String,
        kind: String,
        message: String,
    },

    ContextStateUpdate {
        session_id: String,
        state: ContextState,
    },

    ContextSplitSuggested {
        session_id: String,
        state: ContextState,
    },

    #[serde(rename = "queue-update")]
    QueueUpdate {
        session_id: String,
        queue: Vec<QueuedMessage>,
    },

    /// A turn was admitted under soft enforcement or with active
    /// degradation steps.
    BudgetWarning {
        session_id: String,
        check: BudgetCheck,
    },

    /// Queue draining is held back by quota pressure.
    QueuePaused {
        session_id: String,
        five_hour_pct: Option<f64>,
        pending: usize,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::Message { session_id, .. }
            | SessionEvent::Chunk { session_id, .. }
            | SessionEvent::Status { session_id, .. }
            | SessionEvent::Activity { session_id, .. }
            | SessionEvent::MessageComplete { session_id, .. }
            | SessionEvent::Error { session_id, .. }
            | SessionEvent::ContextStateUpdate { session_id, .. }
            | SessionEvent::ContextSplitSuggested { session_id, .. }
            | SessionEvent::QueueUpdate { session_id, .. }
            | SessionEvent::BudgetWarning { session_id, .. }
            | SessionEvent::QueuePaused { session_id, .. } => session_id,
        }
    }

    pub fn error(session_id: &str, kind: &str, message: impl Into<String>) -> Self {
        SessionEvent::Error {
            session_id: session_id.to_owned(),
            kind: kind.to_owned(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        let complete = SessionEvent::MessageComplete {
            session_id: "s".into(),
            message_id: "m".into(),
        };
        let json = serde_json::to_value(&complete).unwrap();
        assert_eq!(json["type"], "message-complete");

        let queue = SessionEvent::QueueUpdate {
            session_id: "s".into(),
            queue: Vec::new(),
        };
        assert_eq!(serde_json::to_value(&queue).unwrap()["type"], "queue-update");

        let status = SessionEvent::Status {
            session_id: "s".into(),
            chat_status: ChatStatus::Running,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["chat_status"], "running");
    }

    #[test]
    fn error_helper() {
        let ev = SessionEvent::error("s1", "capacity", "queue full");
        assert_eq!(ev.session_id(), "s1");
        assert_eq!(
            serde_json::to_value(&ev).unwrap()["kind"],
            "capacity"
        );
    }
}
