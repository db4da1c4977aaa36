//! Session lifecycle manager.
//!
//! Owns every live session and serializes its turns: at most one agent
//! process per session, later messages wait in the session's bounded queue
//! and drain FIFO once the running turn settles. All state changes are
//! pushed to the session's subscribers through the [`EventBroadcaster`].
//!
//! Each session sits behind its own `parking_lot::Mutex`; the running flag
//! is flipped under that lock before any `.await`, which is what keeps a
//! session single-flight. Locks are never held across an await point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;

use sw_domain::config::{DegradationStep, PromotionConfig, SessionsConfig};
use sw_domain::error::{Error, Result};
use sw_domain::trace::TraceEvent;
use sw_invoker::AgentInvoker;
use sw_sessions::{ChatStatus, IdeaStatus, IdeaStore, ScratchSpace, Session, SessionMode};

use super::broadcast::EventBroadcaster;
use super::cancel::ProcessMap;
use super::context::{ContextManager, ContextState, ContextSummary};
use super::events::SessionEvent;
use super::prompt::handoff_summary;
use super::quota::QuotaAllocator;
use super::turn::PreparedTurn;
use crate::promote::RepoMaterializer;
use crate::quota_source::QuotaSource;

pub(super) type SessionSlot = Arc<Mutex<Session>>;

/// Placeholder text for an assistant message cut short by a cancel.
pub const CANCELLED_TEXT: &str = "[cancelled]";

/// Collaborators and settings for a [`SessionManager`].
pub struct ManagerDeps {
    pub sessions: SessionsConfig,
    pub promotion: PromotionConfig,
    /// Model used when neither the session nor a degradation step picks one.
    pub default_model: Option<String>,
    pub invoker: Arc<dyn AgentInvoker>,
    pub broadcaster: Arc<dyn EventBroadcaster>,
    pub processes: Arc<ProcessMap>,
    pub context: Arc<ContextManager>,
    pub allocator: Arc<QuotaAllocator>,
    pub quota_source: Option<Arc<dyn QuotaSource>>,
    pub store: Arc<IdeaStore>,
    pub scratch: ScratchSpace,
    pub materializer: Arc<dyn RepoMaterializer>,
}

#[derive(Debug, Clone, Default)]
pub struct PromoteOptions {
    /// Repository name; defaults to the session title.
    pub name: Option<String>,
    /// Return a handoff summary of the conversation.
    pub transfer_history: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Promotion {
    pub repo_path: PathBuf,
    pub handoff: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    pub(super) config: SessionsConfig,
    promotion: PromotionConfig,
    pub(super) default_model: Option<String>,
    sessions: RwLock<HashMap<String, SessionSlot>>,
    pub(super) invoker: Arc<dyn AgentInvoker>,
    pub(super) broadcaster: Arc<dyn EventBroadcaster>,
    pub(super) processes: Arc<ProcessMap>,
    pub(super) context: Arc<ContextManager>,
    pub(super) allocator: Arc<QuotaAllocator>,
    pub(super) quota_source: Option<Arc<dyn QuotaSource>>,
    store: Arc<IdeaStore>,
    scratch: ScratchSpace,
    materializer: Arc<dyn RepoMaterializer>,
}

impl SessionManager {
    pub fn new(deps: ManagerDeps) -> Arc<Self> {
        Arc::new(Self {
            config: deps.sessions,
            promotion: deps.promotion,
            default_model: deps.default_model,
            sessions: RwLock::new(HashMap::new()),
            invoker: deps.invoker,
            broadcaster: deps.broadcaster,
            processes: deps.processes,
            context: deps.context,
            allocator: deps.allocator,
            quota_source: deps.quota_source,
            store: deps.store,
            scratch: deps.scratch,
            materializer: deps.materializer,
        })
    }

    /// Load saved ideas into memory. Each comes back idle with an empty
    /// queue; nothing in flight survives a restart.
    pub fn restore_saved(&self) -> usize {
        let restored = self.store.load_all();
        let count = restored.len();
        let mut sessions = self.sessions.write();
        for session in restored {
            for dir in [&session.working_dir, &session.artifacts_dir] {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    tracing::warn!(
                        session_id = %session.id,
                        dir = %dir.display(),
                        error = %e,
                        "could not recreate session directory"
                    );
                }
            }
            sessions.insert(session.id.clone(), Arc::new(Mutex::new(session)));
        }
        tracing::info!(restored = count, "saved ideas restored");
        count
    }

    /// Start a new ephemeral session with fresh scratch directories.
    ///
    /// Refused with [`Error::Blocked`] while the quota ladder blocks new
    /// sessions.
    pub fn create_session(&self) -> Result<Session> {
        if self
            .allocator
            .is_step_active(&DegradationStep::BlockNewSessions)
        {
            return Err(Error::Blocked(
                "new sessions are blocked while quota utilization is high".into(),
            ));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (working_dir, artifacts_dir) = self.scratch.provision(&id)?;
        let session = Session::new(id.clone(), working_dir, artifacts_dir);
        self.sessions
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(session.clone())));
        TraceEvent::SessionCreated { session_id: id }.emit();
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        Ok(self.slot(session_id)?.lock().clone())
    }

    /// All sessions, most recently active first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let slots: Vec<SessionSlot> = self.sessions.read().values().cloned().collect();
        let mut list: Vec<Session> = slots.iter().map(|s| s.lock().clone()).collect();
        list.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        list
    }

    pub fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<SessionEvent>> {
        self.broadcaster.subscribe(session_id)
    }

    /// Agent processes currently registered, turns and summarizations
    /// together. Informational only.
    pub fn active_process_count(&self) -> usize {
        self.processes.active_count()
    }

    /// Run `text` now if the session is idle, otherwise queue it.
    ///
    /// An unknown session fails with [`Error::NotFound`] and the failure is
    /// also broadcast on that session id.
    pub fn send_message(self: &Arc<Self>, session_id: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::EmptyInput("message is empty".into()));
        }
        let slot = self.slot_or_report(session_id)?;

        let (prepared, backlog) = {
            let mut session = slot.lock();
            self.ensure_not_promoted(&session)?;
            if session.is_running() {
                self.enqueue_locked(&mut session, text);
                return Ok(());
            }
            // Earlier queued messages go first. Taking the head before
            // queueing `text` frees the slot it needs.
            let (content, mode) = match session.dequeue() {
                Some(head) => {
                    self.enqueue_locked(&mut session, text);
                    (head.content, head.mode)
                }
                None => (text.to_owned(), session.mode),
            };
            let prepared = self.begin_turn(&mut session, content, mode);
            (prepared, !session.message_queue.is_empty())
        };

        self.start_or_reschedule(session_id, prepared, backlog);
        Ok(())
    }

    /// Queue `text` behind the running turn. A full queue drops the message
    /// and reports it as an error event; the call itself still succeeds.
    pub fn enqueue(&self, session_id: &str, text: &str) -> Result<()> {
        let slot = self.slot_or_report(session_id)?;
        let mut session = slot.lock();
        self.ensure_not_promoted(&session)?;
        self.enqueue_locked(&mut session, text);
        Ok(())
    }

    /// Start the head of an idle session's queue. Returns `false` when the
    /// session is busy, the queue is empty, or quota pressure holds it.
    pub fn drain_queue(self: &Arc<Self>, session_id: &str) -> Result<bool> {
        let slot = self.slot(session_id)?;
        let (prepared, backlog) = {
            let mut session = slot.lock();
            if session.is_running()
                || session.status == IdeaStatus::Promoted
                || session.message_queue.is_empty()
            {
                return Ok(false);
            }
            if let Some(five_hour_pct) = self.queue_pause_level() {
                self.emit(
                    session_id,
                    SessionEvent::QueuePaused {
                        session_id: session_id.to_owned(),
                        five_hour_pct,
                        pending: session.message_queue.len(),
                    },
                );
                return Ok(false);
            }
            let Some(head) = session.dequeue() else {
                return Ok(false);
            };
            self.broadcast_queue(&session);
            let prepared = self.begin_turn(&mut session, head.content, head.mode);
            (prepared, !session.message_queue.is_empty())
        };
        let started = prepared.is_some();
        self.start_or_reschedule(session_id, prepared, backlog);
        Ok(started)
    }

    /// Drain every idle session that still has queued messages. Called
    /// when quota pressure eases.
    pub fn resume_idle_queues(self: &Arc<Self>) -> usize {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.iter()
            .filter(|id| matches!(self.drain_queue(id), Ok(true)))
            .count()
    }

    /// Drop everything waiting in the queue. Returns how many were removed.
    pub fn clear_queue(&self, session_id: &str) -> Result<usize> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        let cleared = session.message_queue.len();
        session.message_queue.clear();
        self.broadcast_queue(&session);
        Ok(cleared)
    }

    /// Stop the in-flight turn, if any. Safe to call repeatedly; returns
    /// whether there was anything to stop. Messages still queued behind the
    /// cancelled turn start once the session has settled.
    pub fn cancel_active(self: &Arc<Self>, session_id: &str) -> Result<bool> {
        let (stopped, backlog) = self.interrupt(session_id)?;
        if stopped && backlog {
            self.schedule_drain(session_id);
        }
        Ok(stopped)
    }

    /// Kill the running turn and settle the session as idle. Returns
    /// whether anything was stopped and whether messages remain queued.
    fn interrupt(&self, session_id: &str) -> Result<(bool, bool)> {
        let slot = self.slot(session_id)?;

        // Clearing the turn id and killing under the session lock pairs
        // with the registration check in the turn task.
        let mut session = slot.lock();
        let was_running = session.is_running();
        session.active_turn_id = None;
        let killed = self.processes.kill(session_id);
        let finalized = session.finalize_streaming(CANCELLED_TEXT);
        session.chat_status = ChatStatus::Idle;
        session.touch();

        for message_id in finalized {
            self.emit(
                session_id,
                SessionEvent::MessageComplete {
                    session_id: session_id.to_owned(),
                    message_id,
                },
            );
        }
        self.emit_status(&session);

        let stopped = killed || was_running;
        if stopped {
            tracing::info!(session_id, killed, "turn cancelled");
            self.persist_if_saved(&session);
        }
        Ok((stopped, !session.message_queue.is_empty()))
    }

    /// Materialize the session into a repository. Terminal: a promoted
    /// session takes no further turns.
    pub async fn promote(&self, session_id: &str, options: PromoteOptions) -> Result<Promotion> {
        let slot = self.slot(session_id)?;

        // Claim the promotion under the lock so no turn can start meanwhile.
        let (previous, title, working_dir, messages) = {
            let mut session = slot.lock();
            if session.is_running() {
                return Err(Error::Conflict(format!(
                    "session {session_id} has a turn in progress"
                )));
            }
            if session.status == IdeaStatus::Promoted {
                return Err(Error::Conflict(format!(
                    "session {session_id} is already promoted"
                )));
            }
            let previous = session.status;
            session.status = IdeaStatus::Promoted;
            (
                previous,
                session.title.clone(),
                session.working_dir.clone(),
                session.messages.clone(),
            )
        };

        let name = options
            .name
            .clone()
            .or_else(|| title.clone())
            .unwrap_or_else(|| format!("idea-{}", short_id(session_id)));

        let repo_path = match self.materializer.materialize(&working_dir, &name).await {
            Ok(path) => path,
            Err(e) => {
                slot.lock().status = previous;
                return Err(e);
            }
        };

        let handoff = options.transfer_history.then(|| {
            handoff_summary(
                title.as_deref(),
                &messages,
                self.promotion.handoff_message_chars,
                self.promotion.handoff_max_chars,
            )
        });

        {
            let mut session = slot.lock();
            session.promoted_repo = Some(repo_path.clone());
            session.message_queue.clear();
            session.touch();
            self.broadcast_queue(&session);
            if previous == IdeaStatus::Saved {
                self.persist_if_saved(&session);
            }
        }

        TraceEvent::SessionPromoted {
            session_id: session_id.to_owned(),
            repo_path: repo_path.display().to_string(),
            transferred_history: options.transfer_history,
        }
        .emit();

        Ok(Promotion { repo_path, handoff })
    }

    /// Cancel, then forget the session everywhere: context state, scratch
    /// directories, and the saved record.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.interrupt(session_id)?;
        let killed_processes = self.processes.kill_group(session_id);
        self.context.clear(session_id);
        self.sessions.write().remove(session_id);

        if let Err(e) = self.scratch.remove(session_id) {
            tracing::warn!(session_id, error = %e, "scratch cleanup failed");
        }
        self.store.remove(session_id)?;

        TraceEvent::SessionDeleted {
            session_id: session_id.to_owned(),
            killed_processes,
        }
        .emit();
        Ok(())
    }

    /// Mark the session saved and write it to the ideas document.
    pub fn save_session(&self, session_id: &str) -> Result<Session> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        if session.status == IdeaStatus::Ephemeral {
            session.status = IdeaStatus::Saved;
        }
        self.store.upsert(&session)?;
        Ok(session.clone())
    }

    pub fn set_mode(&self, session_id: &str, mode: SessionMode) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        session.mode = mode;
        session.touch();
        self.persist_if_saved(&session);
        Ok(())
    }

    /// Per-session model override; `None` falls back to the default.
    pub fn set_model(&self, session_id: &str, model: Option<String>) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        session.model = model;
        self.persist_if_saved(&session);
        Ok(())
    }

    pub fn attach_repo(&self, session_id: &str, repo_id: &str) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        if !session.attached_repo_ids.iter().any(|r| r == repo_id) {
            session.attached_repo_ids.push(repo_id.to_owned());
        }
        session.touch();
        self.persist_if_saved(&session);
        Ok(())
    }

    pub fn context_state(&self, session_id: &str) -> Result<ContextState> {
        let slot = self.slot(session_id)?;
        let session = slot.lock();
        let model = self.effective_model(&session);
        Ok(self
            .context
            .get_context_state(session_id, &session.messages, model.as_deref()))
    }

    /// Summarize the session's older messages now. On success an idle
    /// session drops its resumable handle so the next turn is rebuilt
    /// around the summary.
    pub async fn summarize_session(&self, session_id: &str) -> Result<ContextSummary> {
        let slot = self.slot(session_id)?;
        let (messages, working_dir, model) = {
            let session = slot.lock();
            (
                session.messages.clone(),
                session.working_dir.clone(),
                self.effective_model(&session),
            )
        };

        let summary = self
            .context
            .summarize(session_id, &messages, &working_dir, model.as_deref())
            .await?;

        let mut session = slot.lock();
        if !session.is_running() && session.agent_session_id.take().is_some() {
            tracing::debug!(session_id, "resumable handle dropped after summarization");
            self.persist_if_saved(&session);
        }
        Ok(summary)
    }

    // ── Crate-internal helpers ───────────────────────────────────────

    pub(super) fn slot(&self, session_id: &str) -> Result<SessionSlot> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    pub(super) fn emit(&self, session_id: &str, event: SessionEvent) {
        self.broadcaster.broadcast_to_session(session_id, event);
    }

    pub(super) fn emit_status(&self, session: &Session) {
        self.emit(
            &session.id,
            SessionEvent::Status {
                session_id: session.id.clone(),
                chat_status: session.chat_status,
            },
        );
    }

    pub(super) fn broadcast_queue(&self, session: &Session) {
        self.emit(
            &session.id,
            SessionEvent::QueueUpdate {
                session_id: session.id.clone(),
                queue: session.message_queue.iter().cloned().collect(),
            },
        );
    }

    pub(super) fn persist_if_saved(&self, session: &Session) {
        if session.status == IdeaStatus::Ephemeral {
            return;
        }
        if session.status == IdeaStatus::Promoted && self.store.get(&session.id).is_none() {
            return;
        }
        if let Err(e) = self.store.upsert(session) {
            tracing::warn!(session_id = %session.id, error = %e, "failed to persist session");
        }
    }

    /// Model for the next invocation, before degradation steps apply.
    pub(super) fn effective_model(&self, session: &Session) -> Option<String> {
        session.model.clone().or_else(|| self.default_model.clone())
    }

    /// `Some(latest 5h %)` when queue draining should hold back.
    pub(super) fn queue_pause_level(&self) -> Option<Option<f64>> {
        let latest = self.allocator.latest_sample().map(|s| s.five_hour_pct);
        let paused = latest.is_some_and(|pct| self.allocator.should_pause_queue(pct))
            || self.allocator.is_step_active(&DegradationStep::PauseQueue);
        paused.then_some(latest)
    }

    // ── Private ──────────────────────────────────────────────────────

    /// Spawn a prepared turn. A turn refused at admission still consumed
    /// its message, so whatever is queued behind it gets its own chance.
    fn start_or_reschedule(
        self: &Arc<Self>,
        session_id: &str,
        prepared: Option<PreparedTurn>,
        backlog: bool,
    ) {
        match prepared {
            Some(turn) => self.spawn_turn(turn),
            None if backlog => self.schedule_drain(session_id),
            None => {}
        }
    }

    fn slot_or_report(&self, session_id: &str) -> Result<SessionSlot> {
        self.slot(session_id).inspect_err(|e| {
            self.emit(session_id, SessionEvent::error(session_id, e.kind(), e.to_string()));
        })
    }

    fn ensure_not_promoted(&self, session: &Session) -> Result<()> {
        if session.status == IdeaStatus::Promoted {
            let err = Error::Conflict(format!(
                "session {} was promoted and takes no more messages",
                session.id
            ));
            self.emit(
                &session.id,
                SessionEvent::error(&session.id, err.kind(), err.to_string()),
            );
            return Err(err);
        }
        Ok(())
    }

    fn enqueue_locked(&self, session: &mut Session, text: &str) -> bool {
        let capacity = self.config.queue_capacity;
        match session.enqueue(text, capacity) {
            Ok(_) => {
                TraceEvent::MessageQueued {
                    session_id: session.id.clone(),
                    queue_len: session.message_queue.len(),
                }
                .emit();
                self.broadcast_queue(session);
                true
            }
            Err(e) => {
                TraceEvent::MessageDropped {
                    session_id: session.id.clone(),
                    capacity,
                }
                .emit();
                self.emit(
                    &session.id,
                    SessionEvent::error(&session.id, e.kind(), e.to_string()),
                );
                false
            }
        }
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
