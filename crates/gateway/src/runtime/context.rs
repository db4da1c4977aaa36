//! Context-window accounting and summarization.
//!
//! Usage is estimated at four characters per token over the messages no
//! summary covers, plus the summaries themselves. When the agent has
//! reported real input usage since the last summary, that figure is used
//! instead of the estimate.
//! Past the summarization threshold the older messages are folded into a
//! summary by a short agent run; past the split threshold the user is told
//! to start a new session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use sw_domain::config::ContextConfig;
use sw_domain::error::{Error, Result};
use sw_domain::stream::AgentEvent;
use sw_domain::trace::TraceEvent;
use sw_invoker::{AgentInvoker, InvokeRequest};
use sw_sessions::Message;

use super::broadcast::EventBroadcaster;
use super::cancel::ProcessMap;
use super::events::SessionEvent;
use super::prompt::summarization_prompt;

const CHARS_PER_TOKEN: u64 = 4;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizationStatus {
    #[default]
    None,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub covered_message_ids: Vec<String>,
    pub token_estimate: u64,
    pub text: String,
    pub model: String,
}

/// Derived view of one session's context usage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextState {
    pub model: Option<String>,
    pub max_prompt_tokens: u64,
    pub estimated_tokens: u64,
    pub actual_tokens: u64,
    pub effective_tokens: u64,
    /// `effective_tokens / max_prompt_tokens`, clamped to `0..=1`.
    pub utilization: f64,
    pub summarization_status: SummarizationStatus,
    pub summary_count: usize,
    /// Settled messages not covered by any summary.
    pub verbatim_count: usize,
    pub summarized_count: usize,
}

#[derive(Debug, Default)]
struct SessionContext {
    actual_input_tokens: u64,
    status: SummarizationStatus,
    summaries: Vec<ContextSummary>,
}

impl SessionContext {
    fn covered_ids(&self) -> HashSet<&str> {
        self.summaries
            .iter()
            .flat_map(|s| s.covered_message_ids.iter().map(String::as_str))
            .collect()
    }
}

/// Character-count heuristic: `ceil(total_chars / 4)`.
pub fn estimate_tokens<'a>(messages: impl IntoIterator<Item = &'a Message>) -> u64 {
    let chars: u64 = messages
        .into_iter()
        .map(|m| m.content.chars().count() as u64)
        .sum();
    chars.div_ceil(CHARS_PER_TOKEN)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ContextManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ContextManager {
    config: RwLock<ContextConfig>,
    summarization_model: String,
    states: RwLock<HashMap<String, SessionContext>>,
    invoker: Arc<dyn AgentInvoker>,
    broadcaster: Arc<dyn EventBroadcaster>,
    processes: Arc<ProcessMap>,
}

impl ContextManager {
    pub fn new(
        config: ContextConfig,
        summarization_model: String,
        invoker: Arc<dyn AgentInvoker>,
        broadcaster: Arc<dyn EventBroadcaster>,
        processes: Arc<ProcessMap>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            summarization_model,
            states: RwLock::new(HashMap::new()),
            invoker,
            broadcaster,
            processes,
        }
    }

    pub fn config(&self) -> ContextConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: ContextConfig) {
        *self.config.write() = config;
    }

    /// Current view of `session_id`'s context. Pure: calling it twice with
    /// the same inputs gives the same answer.
    pub fn get_context_state(
        &self,
        session_id: &str,
        messages: &[Message],
        model: Option<&str>,
    ) -> ContextState {
        let config = self.config.read();
        let states = self.states.read();
        let empty = SessionContext::default();
        let ctx = states.get(session_id).unwrap_or(&empty);

        let covered = ctx.covered_ids();
        let verbatim: Vec<&Message> = messages
            .iter()
            .filter(|m| !m.is_streaming && !covered.contains(m.id.as_str()))
            .collect();
        let summarized_count = messages
            .iter()
            .filter(|m| covered.contains(m.id.as_str()))
            .count();

        let summary_tokens: u64 = ctx.summaries.iter().map(|s| s.token_estimate).sum();
        let estimated = estimate_tokens(verbatim.iter().copied()) + summary_tokens;
        let effective = if ctx.actual_input_tokens > 0 {
            ctx.actual_input_tokens
        } else {
            estimated
        };
        let max_prompt_tokens = config.window_for(model).max(1);

        ContextState {
            model: model.map(str::to_owned),
            max_prompt_tokens,
            estimated_tokens: estimated,
            actual_tokens: ctx.actual_input_tokens,
            effective_tokens: effective,
            utilization: (effective as f64 / max_prompt_tokens as f64).min(1.0),
            summarization_status: ctx.status,
            summary_count: ctx.summaries.len(),
            verbatim_count: verbatim.len(),
            summarized_count,
        }
    }

    /// Record the prompt-side usage the agent reported for the last turn.
    pub fn update_actual_usage(&self, session_id: &str, input_tokens: u64) {
        self.states
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .actual_input_tokens = input_tokens;
    }

    pub fn should_summarize(&self, state: &ContextState) -> bool {
        let config = self.config.read();
        state.utilization >= config.summarization_threshold
            && state.summarization_status != SummarizationStatus::InProgress
            && state.verbatim_count > config.verbatim_recent_count * 2
    }

    pub fn should_suggest_split(&self, state: &ContextState) -> bool {
        state.utilization >= self.config.read().split_threshold
    }

    pub fn summaries(&self, session_id: &str) -> Vec<ContextSummary> {
        self.states
            .read()
            .get(session_id)
            .map(|c| c.summaries.clone())
            .unwrap_or_default()
    }

    /// Forget everything about `session_id`.
    pub fn clear(&self, session_id: &str) {
        self.states.write().remove(session_id);
    }

    /// Fold all but the most recent `2 × verbatim_recent_count` settled
    /// messages into a new summary.
    ///
    /// Fails with [`Error::Conflict`] while another summarization for the
    /// session is running and [`Error::EmptyInput`] when nothing is old
    /// enough to summarize.
    pub async fn summarize(
        &self,
        session_id: &str,
        messages: &[Message],
        working_dir: &std::path::Path,
        model: Option<&str>,
    ) -> Result<ContextSummary> {
        let config = self.config();
        self.broadcast_state(session_id, messages, model);

        // Select and flip to in-progress under one lock.
        let (selected, previous) = {
            let mut states = self.states.write();
            let ctx = states.entry(session_id.to_owned()).or_default();
            if ctx.status == SummarizationStatus::InProgress {
                return Err(Error::Conflict(format!(
                    "summarization already running for session {session_id}"
                )));
            }
            let covered = ctx.covered_ids();
            let eligible: Vec<&Message> = messages
                .iter()
                .filter(|m| !m.is_streaming && !covered.contains(m.id.as_str()))
                .collect();
            let keep = config.verbatim_recent_count * 2;
            if eligible.len() <= keep {
                return Err(Error::EmptyInput(format!(
                    "session {session_id} has no messages older than the last {keep}"
                )));
            }
            let selected: Vec<Message> = eligible[..eligible.len() - keep]
                .iter()
                .map(|m| (*m).clone())
                .collect();
            ctx.status = SummarizationStatus::InProgress;
            (selected, ctx.summaries.last().cloned())
        };
        self.broadcast_state(session_id, messages, model);

        let start = Instant::now();
        let refs: Vec<&Message> = selected.iter().collect();
        let prompt = summarization_prompt(&refs, previous.as_ref(), config.max_message_length);
        let result = self
            .run_summarizer(
                session_id,
                prompt,
                working_dir,
                Duration::from_secs(config.summarization_timeout_sec),
            )
            .await;

        let outcome = {
            let mut states = self.states.write();
            let ctx = states.entry(session_id.to_owned()).or_default();
            match result {
                Ok(text) => {
                    let summary = ContextSummary {
                        id: uuid::Uuid::new_v4().to_string(),
                        created_at: Utc::now(),
                        covered_message_ids: selected.iter().map(|m| m.id.clone()).collect(),
                        token_estimate: (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN),
                        text,
                        model: self.summarization_model.clone(),
                    };
                    ctx.summaries.push(summary.clone());
                    let cap = config.max_summaries.max(1);
                    if ctx.summaries.len() > cap {
                        let excess = ctx.summaries.len() - cap;
                        let dropped: Vec<String> = ctx
                            .summaries
                            .drain(..excess)
                            .flat_map(|s| s.covered_message_ids)
                            .collect();
                        // Dropped coverage stays covered: summaries are cumulative.
                        if let Some(oldest) = ctx.summaries.first_mut() {
                            oldest.covered_message_ids.splice(0..0, dropped);
                        }
                    }
                    ctx.status = SummarizationStatus::Completed;
                    // The last reported usage predates the summary.
                    ctx.actual_input_tokens = 0;
                    Ok(summary)
                }
                Err(e) => {
                    ctx.status = SummarizationStatus::Failed;
                    Err(e)
                }
            }
        };

        TraceEvent::SummarizationFinished {
            session_id: session_id.to_owned(),
            covered_messages: selected.len(),
            token_estimate: outcome.as_ref().map(|s| s.token_estimate).unwrap_or(0),
            success: outcome.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
        .emit();
        if let Err(e) = &outcome {
            tracing::warn!(session_id, error = %e, "summarization failed");
        }

        self.broadcast_state(session_id, messages, model);
        outcome
    }

    pub fn broadcast_state(&self, session_id: &str, messages: &[Message], model: Option<&str>) {
        let state = self.get_context_state(session_id, messages, model);
        self.broadcaster.broadcast_to_session(
            session_id,
            SessionEvent::ContextStateUpdate {
                session_id: session_id.to_owned(),
                state,
            },
        );
    }

    // ── Private ──────────────────────────────────────────────────────

    async fn run_summarizer(
        &self,
        session_id: &str,
        prompt: String,
        working_dir: &std::path::Path,
        timeout: Duration,
    ) -> Result<String> {
        let run = self
            .invoker
            .spawn(InvokeRequest {
                working_dir: working_dir.to_path_buf(),
                prompt,
                artifacts_dir: None,
                resume_session_id: None,
                model: Some(self.summarization_model.clone()),
            })
            .await?;

        let key = format!("{session_id}:summary");
        let handle = run.handle.clone();
        self.processes.register(&key, run.handle);
        self.processes.add_to_group(session_id, &key);

        let collected = tokio::time::timeout(timeout, collect_text(run.events)).await;

        self.processes.remove(&key, handle.id());
        self.processes.remove_from_group(session_id, &key);

        match collected {
            Ok(result) => result,
            Err(_) => {
                handle.kill();
                Err(Error::Timeout(format!(
                    "summarization exceeded {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}

/// Concatenate text events until `Exit`; fail unless the run succeeded
/// with non-empty output.
async fn collect_text(mut events: mpsc::Receiver<AgentEvent>) -> Result<String> {
    let mut text = String::new();
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Text { content } => text.push_str(&content),
            AgentEvent::Exit { outcome } if outcome.success => {
                let text = text.trim().to_owned();
                if text.is_empty() {
                    return Err(Error::Agent("summarizer produced no text".into()));
                }
                return Ok(text);
            }
            AgentEvent::Exit { outcome } => {
                return Err(Error::Agent(
                    outcome
                        .error
                        .unwrap_or_else(|| "summarizer failed".into()),
                ));
            }
            _ => {}
        }
    }
    Err(Error::Agent("summarizer stream ended without exit".into()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::broadcast::ChannelBroadcaster;
    use sw_invoker::{Script, ScriptedInvoker};
    use sw_sessions::Role;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            is_streaming: false,
            timestamp: Utc::now(),
        }
    }

    fn conversation(n: usize, chars: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                msg(role, &"x".repeat(chars))
            })
            .collect()
    }

    struct Fixture {
        manager: Arc<ContextManager>,
        invoker: Arc<ScriptedInvoker>,
        broadcaster: Arc<ChannelBroadcaster>,
        processes: Arc<ProcessMap>,
    }

    fn fixture(config: ContextConfig) -> Fixture {
        let invoker = Arc::new(ScriptedInvoker::new());
        let broadcaster = Arc::new(ChannelBroadcaster::new(64));
        let processes = Arc::new(ProcessMap::new());
        let manager = Arc::new(ContextManager::new(
            config,
            "haiku".into(),
            invoker.clone(),
            broadcaster.clone(),
            processes.clone(),
        ));
        Fixture {
            manager,
            invoker,
            broadcaster,
            processes,
        }
    }

    #[test]
    fn estimate_rounds_up() {
        let m = [msg(Role::User, &"a".repeat(400)), msg(Role::Assistant, &"b".repeat(400))];
        assert_eq!(estimate_tokens(&m), 200);
        assert_eq!(estimate_tokens(&[msg(Role::User, "")]), 0);
        assert_eq!(estimate_tokens(&[msg(Role::User, "abcde")]), 2);
        assert_eq!(estimate_tokens(std::iter::empty()), 0);
    }

    #[test]
    fn state_is_idempotent() {
        let f = fixture(ContextConfig::default());
        let msgs = conversation(4, 100);
        let a = f.manager.get_context_state("s", &msgs, None);
        let b = f.manager.get_context_state("s", &msgs, None);
        assert_eq!(a, b);
        assert_eq!(a.estimated_tokens, 100);
        assert_eq!(a.verbatim_count, 4);
        assert_eq!(a.summarization_status, SummarizationStatus::None);
    }

    #[test]
    fn actual_usage_takes_precedence() {
        let f = fixture(ContextConfig {
            max_prompt_tokens: 1_000,
            ..Default::default()
        });
        let msgs = conversation(2, 40);
        f.manager.update_actual_usage("s", 800);
        let state = f.manager.get_context_state("s", &msgs, None);
        assert_eq!(state.estimated_tokens, 20);
        assert_eq!(state.effective_tokens, 800);
        assert!((state.utilization - 0.8).abs() < 1e-9);
    }

    #[test]
    fn actual_usage_replaces_a_larger_estimate() {
        let f = fixture(ContextConfig {
            max_prompt_tokens: 10_000,
            ..Default::default()
        });
        let msgs = [msg(Role::User, &"x".repeat(4_000))];
        f.manager.update_actual_usage("s", 500);
        let state = f.manager.get_context_state("s", &msgs, None);
        assert_eq!(state.estimated_tokens, 1_000);
        assert_eq!(state.effective_tokens, 500);
        assert!((state.utilization - 0.05).abs() < 1e-9);

        f.manager.update_actual_usage("s", 0);
        let state = f.manager.get_context_state("s", &msgs, None);
        assert_eq!(state.effective_tokens, 1_000);
    }

    #[test]
    fn streaming_messages_are_ignored() {
        let f = fixture(ContextConfig::default());
        let mut msgs = conversation(2, 40);
        let mut p = msg(Role::Assistant, &"y".repeat(4000));
        p.is_streaming = true;
        msgs.push(p);
        let state = f.manager.get_context_state("s", &msgs, None);
        assert_eq!(state.estimated_tokens, 20);
        assert_eq!(state.verbatim_count, 2);
    }

    #[test]
    fn model_window_is_used() {
        let mut config = ContextConfig::default();
        config.model_windows.insert("small".into(), 100);
        let f = fixture(config);
        let msgs = conversation(2, 200);
        let state = f.manager.get_context_state("s", &msgs, Some("small"));
        assert_eq!(state.max_prompt_tokens, 100);
        assert!((state.utilization - 1.0).abs() < 1e-9);
    }

    #[test]
    fn thresholds() {
        let f = fixture(ContextConfig {
            max_prompt_tokens: 1_000,
            summarization_threshold: 0.5,
            split_threshold: 0.9,
            verbatim_recent_count: 2,
            ..Default::default()
        });
        // 12 messages × 40 tokens = 480 tokens → 0.48.
        let msgs = conversation(12, 160);
        let state = f.manager.get_context_state("s", &msgs, None);
        assert!(!f.manager.should_summarize(&state));

        let msgs = conversation(12, 200);
        let state = f.manager.get_context_state("s", &msgs, None);
        assert!(f.manager.should_summarize(&state));
        assert!(!f.manager.should_suggest_split(&state));

        // Too few verbatim messages to be worth it.
        let msgs = conversation(4, 2_000);
        let state = f.manager.get_context_state("s", &msgs, None);
        assert!(!f.manager.should_summarize(&state));
        assert!(f.manager.should_suggest_split(&state));
    }

    #[tokio::test]
    async fn summarize_covers_older_messages() {
        let f = fixture(ContextConfig {
            verbatim_recent_count: 1,
            ..Default::default()
        });
        let msgs = conversation(6, 400);
        f.manager.update_actual_usage("s", 5_000);
        f.invoker.push(Script::reply("Goal: parser. Decided: nom."));

        let dir = tempfile::tempdir().unwrap();
        let summary = f
            .manager
            .summarize("s", &msgs, dir.path(), None)
            .await
            .unwrap();
        assert_eq!(summary.covered_message_ids.len(), 4);
        assert_eq!(summary.covered_message_ids[0], msgs[0].id);
        assert_eq!(summary.model, "haiku");

        let state = f.manager.get_context_state("s", &msgs, None);
        assert_eq!(state.summarization_status, SummarizationStatus::Completed);
        assert_eq!(state.summary_count, 1);
        assert_eq!(state.verbatim_count, 2);
        assert_eq!(state.summarized_count, 4);
        assert_eq!(state.actual_tokens, 0);
        assert_eq!(state.estimated_tokens, 200 + summary.token_estimate);

        let req = &f.invoker.requests()[0];
        assert_eq!(req.model.as_deref(), Some("haiku"));
        assert!(req.resume_session_id.is_none());
        assert_eq!(f.processes.active_count(), 0);
    }

    #[tokio::test]
    async fn summarize_with_nothing_old_enough() {
        let f = fixture(ContextConfig::default());
        let msgs = conversation(4, 10);
        let dir = tempfile::tempdir().unwrap();
        let err = f
            .manager
            .summarize("s", &msgs, dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyInput(_)));
        assert!(f.invoker.requests().is_empty());
    }

    #[tokio::test]
    async fn concurrent_summarize_conflicts() {
        let f = fixture(ContextConfig {
            verbatim_recent_count: 1,
            ..Default::default()
        });
        let msgs = conversation(6, 40);
        f.invoker.push(Script::reply("summary").held());
        let mut rx = f.broadcaster.subscribe("s");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let first = {
            let manager = f.manager.clone();
            let msgs = msgs.clone();
            tokio::spawn(async move { manager.summarize("s", &msgs, &path, None).await })
        };

        // Wait until the first run reports in-progress.
        loop {
            match rx.recv().await.unwrap() {
                SessionEvent::ContextStateUpdate { state, .. }
                    if state.summarization_status == SummarizationStatus::InProgress =>
                {
                    break
                }
                _ => {}
            }
        }

        let second = f.manager.summarize("s", &msgs, dir.path(), None).await;
        assert!(matches!(second, Err(Error::Conflict(_))));

        f.invoker.release();
        let summary = first.await.unwrap().unwrap();
        assert_eq!(summary.text, "summary");
        assert_eq!(f.manager.summaries("s").len(), 1);
    }

    #[tokio::test]
    async fn failed_run_marks_failed() {
        let f = fixture(ContextConfig {
            verbatim_recent_count: 1,
            ..Default::default()
        });
        let msgs = conversation(6, 40);
        f.invoker.push(Script::failure("rate limited", Some(1)));
        let dir = tempfile::tempdir().unwrap();

        let err = f
            .manager
            .summarize("s", &msgs, dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Agent(_)));
        let state = f.manager.get_context_state("s", &msgs, None);
        assert_eq!(state.summarization_status, SummarizationStatus::Failed);
        assert_eq!(state.summary_count, 0);

        // A failed run does not block the next attempt.
        f.invoker.push(Script::reply("ok"));
        assert!(f.manager.summarize("s", &msgs, dir.path(), None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_kills_summarizer() {
        let f = fixture(ContextConfig {
            verbatim_recent_count: 1,
            summarization_timeout_sec: 60,
            ..Default::default()
        });
        let msgs = conversation(6, 40);
        f.invoker.push(Script::reply("never finishes").held());
        let dir = tempfile::tempdir().unwrap();

        let err = f
            .manager
            .summarize("s", &msgs, dir.path(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(f.processes.active_count(), 0);
    }

    #[tokio::test]
    async fn summaries_are_capped() {
        let f = fixture(ContextConfig {
            verbatim_recent_count: 1,
            max_summaries: 2,
            ..Default::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let mut msgs = conversation(2, 40);
        for round in 0..3 {
            msgs.extend(conversation(2, 40));
            f.invoker.push(Script::reply(format!("summary {round}")));
            f.manager
                .summarize("s", &msgs, dir.path(), None)
                .await
                .unwrap();
        }
        let summaries = f.manager.summaries("s");
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[1].text, "summary 2");
        let state = f.manager.get_context_state("s", &msgs, None);
        assert_eq!(state.summarized_count, 6);
        assert_eq!(state.verbatim_count, 2);

        f.manager.clear("s");
        assert!(f.manager.summaries("s").is_empty());
    }
}
