//! Saved-idea store.
//!
//! Persists saved sessions in `ideas.json` under the configured state path
//! as `{ "ideas": [ ... ] }`. Ephemeral sessions never reach this file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sw_domain::error::{Error, Result};
use sw_domain::trace::TraceEvent;

use crate::model::{IdeaStatus, Session};

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdeasDocument {
    #[serde(default)]
    ideas: Vec<Session>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Idea store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Saved sessions backed by a single JSON document.
pub struct IdeaStore {
    ideas_path: PathBuf,
    ideas: RwLock<HashMap<String, Session>>,
}

impl IdeaStore {
    /// Load or create the store at `ideas_path`.
    ///
    /// A corrupt document is logged and treated as empty rather than
    /// blocking startup; it is overwritten on the next save.
    pub fn new(ideas_path: &Path) -> Result<Self> {
        if let Some(dir) = ideas_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let ideas: HashMap<String, Session> = if ideas_path.exists() {
            let raw = std::fs::read_to_string(ideas_path)?;
            match serde_json::from_str::<IdeasDocument>(&raw) {
                Ok(doc) => doc.ideas.into_iter().map(|s| (s.id.clone(), s)).collect(),
                Err(e) => {
                    tracing::warn!(
                        path = %ideas_path.display(),
                        error = %e,
                        "ideas document unreadable, starting empty"
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        tracing::info!(
            ideas = ideas.len(),
            path = %ideas_path.display(),
            "idea store loaded"
        );

        Ok(Self {
            ideas_path: ideas_path.to_path_buf(),
            ideas: RwLock::new(ideas),
        })
    }

    /// Every stored idea, normalized for a fresh process (idle, empty queue).
    pub fn load_all(&self) -> Vec<Session> {
        self.ideas
            .read()
            .values()
            .cloned()
            .map(|mut s| {
                s.reset_for_reload();
                s
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.ideas.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.ideas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ideas.read().is_empty()
    }

    /// Insert or replace a saved session and flush to disk.
    ///
    /// Ephemeral sessions are rejected; the queue is never persisted.
    pub fn upsert(&self, session: &Session) -> Result<()> {
        if session.status == IdeaStatus::Ephemeral {
            return Err(Error::Conflict(format!(
                "session {} is ephemeral and cannot be persisted",
                session.id
            )));
        }
        let mut stored = session.clone();
        stored.message_queue.clear();
        if stored.saved_at.is_none() {
            stored.saved_at = Some(Utc::now());
        }

        let messages = stored.messages.len();
        self.ideas.write().insert(stored.id.clone(), stored);
        self.flush()?;

        TraceEvent::SessionSaved {
            session_id: session.id.clone(),
            messages,
        }
        .emit();
        Ok(())
    }

    /// Drop a stored idea. Returns `true` if something was removed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.ideas.write().remove(id).is_some();
        if removed {
            self.flush()?;
        }
        Ok(removed)
    }

    /// Persist the current ideas to disk (write to a temp file, then rename).
    pub fn flush(&self) -> Result<()> {
        let doc = {
            let ideas = self.ideas.read();
            let mut list: Vec<&Session> = ideas.values().collect();
            list.sort_by_key(|s| s.created_at);
            serde_json::to_string_pretty(&serde_json::json!({ "ideas": list }))
                .map_err(|e| Error::Other(format!("serializing ideas: {e}")))?
        };
        let tmp = self.ideas_path.with_extension("json.tmp");
        std::fs::write(&tmp, doc)?;
        std::fs::rename(&tmp, &self.ideas_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatStatus, Message};

    fn saved_session(id: &str) -> Session {
        let mut s = Session::new(id.into(), "/tmp/w".into(), "/tmp/a".into());
        s.status = IdeaStatus::Saved;
        s
    }

    #[test]
    fn upsert_then_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ideas.json");

        let store = IdeaStore::new(&path).unwrap();
        let mut s = saved_session("a");
        s.messages.push(Message::user("hello"));
        s.enqueue("queued", 10).unwrap();
        s.chat_status = ChatStatus::Running;
        store.upsert(&s).unwrap();

        let reloaded = IdeaStore::new(&path).unwrap();
        let all = reloaded.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].messages.len(), 1);
        assert!(all[0].message_queue.is_empty());
        assert_eq!(all[0].chat_status, ChatStatus::Idle);
        assert!(all[0].saved_at.is_some());
    }

    #[test]
    fn document_has_ideas_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ideas.json");
        let store = IdeaStore::new(&path).unwrap();
        store.upsert(&saved_session("a")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["ideas"].as_array().unwrap().len(), 1);
        assert_eq!(raw["ideas"][0]["id"], "a");
        assert_eq!(raw["ideas"][0]["status"], "saved");
    }

    #[test]
    fn ephemeral_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdeaStore::new(&dir.path().join("ideas.json")).unwrap();
        let s = Session::new("e".into(), "/tmp/w".into(), "/tmp/a".into());
        assert!(matches!(store.upsert(&s), Err(Error::Conflict(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn remove_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ideas.json");
        let store = IdeaStore::new(&path).unwrap();
        store.upsert(&saved_session("a")).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(IdeaStore::new(&path).unwrap().is_empty());
    }

    #[test]
    fn corrupt_document_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ideas.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = IdeaStore::new(&path).unwrap();
        assert_eq!(store.len(), 0);
    }
}
