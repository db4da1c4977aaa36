use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sw_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeaStatus {
    /// In memory only; gone on restart.
    #[default]
    Ephemeral,
    /// Written to the ideas document.
    Saved,
    /// Materialized into a repository. Terminal: no further turns.
    Promoted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    #[default]
    Idle,
    Running,
    Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    #[default]
    Direct,
    Plan,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionMode::Direct => "direct",
            SessionMode::Plan => "plan",
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(SessionMode::Direct),
            "plan" => Ok(SessionMode::Plan),
            other => Err(Error::Other(format!("unknown mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// True while the assistant placeholder is still receiving chunks.
    #[serde(default)]
    pub is_streaming: bool,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.into(),
            is_streaming: false,
            timestamp: Utc::now(),
        }
    }

    /// Empty assistant message that receives streamed chunks.
    pub fn placeholder() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: String::new(),
            is_streaming: true,
            timestamp: Utc::now(),
        }
    }
}

/// A message waiting for the running turn to finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub content: String,
    /// Session mode at the time the message was queued.
    pub mode: SessionMode,
    pub queued_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: IdeaStatus,
    #[serde(default)]
    pub chat_status: ChatStatus,
    #[serde(default)]
    pub mode: SessionMode,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub message_queue: VecDeque<QueuedMessage>,
    /// Resumable conversation id handed back by the agent.
    #[serde(default)]
    pub agent_session_id: Option<String>,
    #[serde(default)]
    pub attached_repo_ids: Vec<String>,
    pub working_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    /// Model override for this session's turns.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub split_suggested: bool,
    #[serde(default)]
    pub promoted_repo: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    /// Id of the turn currently allowed to mutate this session.
    #[serde(skip)]
    pub active_turn_id: Option<String>,
}

impl Session {
    pub fn new(id: String, working_dir: PathBuf, artifacts_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: None,
            status: IdeaStatus::Ephemeral,
            chat_status: ChatStatus::Idle,
            mode: SessionMode::Direct,
            messages: Vec::new(),
            message_queue: VecDeque::new(),
            agent_session_id: None,
            attached_repo_ids: Vec::new(),
            working_dir,
            artifacts_dir,
            model: None,
            split_suggested: false,
            promoted_repo: None,
            created_at: now,
            last_activity_at: now,
            saved_at: None,
            active_turn_id: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.chat_status == ChatStatus::Running
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Append to the queue, or fail with [`Error::Capacity`] when full.
    pub fn enqueue(&mut self, content: &str, capacity: usize) -> Result<QueuedMessage> {
        if self.message_queue.len() >= capacity {
            return Err(Error::Capacity(format!(
                "queue full ({capacity} messages waiting)"
            )));
        }
        let queued = QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_owned(),
            mode: self.mode,
            queued_at: Utc::now(),
        };
        self.message_queue.push_back(queued.clone());
        self.touch();
        Ok(queued)
    }

    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.message_queue.pop_front()
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Append a chunk to a still-streaming message. Returns `false` when the
    /// message is gone or already finalized.
    pub fn append_chunk(&mut self, message_id: &str, chunk: &str) -> bool {
        match self.message_mut(message_id) {
            Some(m) if m.is_streaming => {
                m.content.push_str(chunk);
                true
            }
            _ => false,
        }
    }

    /// Stop streaming on every placeholder, filling empty ones with
    /// `fallback`. Returns the ids of the messages that were finalized.
    pub fn finalize_streaming(&mut self, fallback: &str) -> Vec<String> {
        let mut finalized = Vec::new();
        for m in self.messages.iter_mut().filter(|m| m.is_streaming) {
            m.is_streaming = false;
            if m.content.trim().is_empty() {
                m.content = fallback.to_owned();
            }
            finalized.push(m.id.clone());
        }
        finalized
    }

    /// Normalize a session read back from disk: nothing can be running or
    /// queued after a restart.
    pub fn reset_for_reload(&mut self) {
        self.message_queue.clear();
        self.chat_status = ChatStatus::Idle;
        self.active_turn_id = None;
        self.finalize_streaming("[interrupted]");
    }

    /// Messages whose content is final.
    pub fn settled_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| !m.is_streaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("s1".into(), "/tmp/w".into(), "/tmp/a".into())
    }

    #[test]
    fn enqueue_respects_capacity() {
        let mut s = session();
        assert!(s.enqueue("one", 2).is_ok());
        assert!(s.enqueue("two", 2).is_ok());
        let err = s.enqueue("three", 2).unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert_eq!(s.message_queue.len(), 2);
        assert_eq!(s.dequeue().unwrap().content, "one");
    }

    #[test]
    fn queued_message_snapshots_mode() {
        let mut s = session();
        s.mode = SessionMode::Plan;
        s.enqueue("x", 10).unwrap();
        s.mode = SessionMode::Direct;
        assert_eq!(s.dequeue().unwrap().mode, SessionMode::Plan);
    }

    #[test]
    fn append_chunk_stops_after_finalize() {
        let mut s = session();
        let p = Message::placeholder();
        let id = p.id.clone();
        s.messages.push(p);
        assert!(s.append_chunk(&id, "hel"));
        assert!(s.append_chunk(&id, "lo"));
        assert_eq!(s.finalize_streaming("[cancelled]"), vec![id.clone()]);
        assert!(!s.append_chunk(&id, "late"));
        assert_eq!(s.message(&id).unwrap().content, "hello");
    }

    #[test]
    fn finalize_fills_empty_placeholder() {
        let mut s = session();
        s.messages.push(Message::placeholder());
        s.finalize_streaming("[cancelled]");
        assert_eq!(s.messages[0].content, "[cancelled]");
        assert!(!s.messages[0].is_streaming);
    }

    #[test]
    fn reload_clears_runtime_state() {
        let mut s = session();
        s.chat_status = ChatStatus::Running;
        s.active_turn_id = Some("t".into());
        s.enqueue("pending", 10).unwrap();
        s.messages.push(Message::placeholder());
        s.reset_for_reload();
        assert_eq!(s.chat_status, ChatStatus::Idle);
        assert!(s.message_queue.is_empty());
        assert!(s.active_turn_id.is_none());
        assert_eq!(s.settled_messages().count(), 1);
    }

    #[test]
    fn mode_parses() {
        assert_eq!("plan".parse::<SessionMode>().unwrap(), SessionMode::Plan);
        assert!("fast".parse::<SessionMode>().is_err());
    }
}
