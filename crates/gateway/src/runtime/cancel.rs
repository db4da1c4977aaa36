//! Registry of in-flight agent processes, keyed by session.
//!
//! A session has at most one turn process registered under its id.
//! Auxiliary processes (summarization runs) register under their own key
//! and join the session's **group**, so deleting a session can kill
//! everything it started while a plain cancel only stops the turn.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use sw_invoker::ProcessHandle;

pub struct ProcessMap {
    handles: Mutex<HashMap<String, ProcessHandle>>,
    /// group key (session id) → auxiliary process keys.
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for ProcessMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMap {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Register `handle` under `key`, returning whatever it replaced.
    pub fn register(&self, key: &str, handle: ProcessHandle) -> Option<ProcessHandle> {
        self.handles.lock().insert(key.to_owned(), handle)
    }

    /// Remove and kill the process under `key`. Returns `true` if one was
    /// registered. Calling it again is a no-op.
    pub fn kill(&self, key: &str) -> bool {
        let handle = self.handles.lock().remove(key);
        match handle {
            Some(h) => {
                h.kill();
                true
            }
            None => false,
        }
    }

    /// Kill `key` and every process in its group. Returns how many
    /// processes were signalled.
    pub fn kill_group(&self, key: &str) -> usize {
        let children = self.groups.lock().remove(key).unwrap_or_default();
        let mut killed = usize::from(self.kill(key));
        for child in children {
            if self.kill(&child) {
                killed += 1;
            }
        }
        killed
    }

    /// Remove the entry for `key` only if it still holds the handle with
    /// `handle_id`; a newer registration is left alone.
    pub fn remove(&self, key: &str, handle_id: &str) -> bool {
        let mut handles = self.handles.lock();
        match handles.get(key) {
            Some(h) if h.id() == handle_id => {
                handles.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.handles.lock().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<ProcessHandle> {
        self.handles.lock().get(key).cloned()
    }

    /// Number of registered processes across all sessions.
    pub fn active_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn add_to_group(&self, group: &str, key: &str) {
        self.groups
            .lock()
            .entry(group.to_owned())
            .or_default()
            .insert(key.to_owned());
    }

    pub fn remove_from_group(&self, group: &str, key: &str) {
        let mut groups = self.groups.lock();
        if let Some(children) = groups.get_mut(group) {
            children.remove(key);
            if children.is_empty() {
                groups.remove(group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle() -> (ProcessHandle, mpsc::Receiver<()>) {
        ProcessHandle::new(None)
    }

    #[test]
    fn kill_is_idempotent() {
        let map = ProcessMap::new();
        let (h, mut rx) = handle();
        map.register("s1", h);
        assert!(map.is_running("s1"));

        assert!(map.kill("s1"));
        assert!(rx.try_recv().is_ok());
        assert!(!map.is_running("s1"));

        assert!(!map.kill("s1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_ignores_stale_handle() {
        let map = ProcessMap::new();
        let (old, _old_rx) = handle();
        let (new, _new_rx) = handle();
        let old_id = old.id().to_owned();
        map.register("s1", old);
        let replaced = map.register("s1", new.clone());
        assert_eq!(replaced.map(|h| h.id().to_owned()), Some(old_id.clone()));

        // Completion of the old run must not evict the new one.
        assert!(!map.remove("s1", &old_id));
        assert!(map.is_running("s1"));
        assert!(map.remove("s1", new.id()));
        assert!(!map.is_running("s1"));
    }

    #[test]
    fn kill_group_reaches_children() {
        let map = ProcessMap::new();
        let (turn, mut turn_rx) = handle();
        let (summary, mut summary_rx) = handle();
        map.register("s1", turn);
        map.register("s1:summary", summary);
        map.add_to_group("s1", "s1:summary");

        assert_eq!(map.kill_group("s1"), 2);
        assert!(turn_rx.try_recv().is_ok());
        assert!(summary_rx.try_recv().is_ok());
        assert_eq!(map.active_count(), 0);
        assert_eq!(map.kill_group("s1"), 0);
    }

    #[test]
    fn plain_kill_spares_group_members() {
        let map = ProcessMap::new();
        let (turn, _turn_rx) = handle();
        let (summary, mut summary_rx) = handle();
        map.register("s1", turn);
        map.register("s1:summary", summary);
        map.add_to_group("s1", "s1:summary");

        assert!(map.kill("s1"));
        assert!(summary_rx.try_recv().is_err());
        assert!(map.is_running("s1:summary"));
    }

    #[test]
    fn removed_group_member_is_not_killed() {
        let map = ProcessMap::new();
        let (summary, mut rx) = handle();
        map.register("s1:summary", summary);
        map.add_to_group("s1", "s1:summary");
        map.remove_from_group("s1", "s1:summary");
        map.remove_from_group("nope", "x");

        assert_eq!(map.kill_group("s1"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn active_count_spans_sessions() {
        let map = ProcessMap::default();
        let (a, _ra) = handle();
        let (b, _rb) = handle();
        map.register("a", a);
        map.register("b", b);
        assert_eq!(map.active_count(), 2);
        assert!(map.get("a").is_some());
    }
}
