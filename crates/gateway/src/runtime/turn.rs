//! The turn pipeline: one user message in, one streamed assistant reply out.
//!
//! [`SessionManager::begin_turn`] runs with the session lock held and does
//! everything that must happen before the first await: record the user
//! message, admission control, placeholder, running flag, prompt. The
//! spawned task then streams the agent's events into the placeholder and
//! settles the session when the agent exits.
//!
//! Every mutation made from the task checks that its turn id is still the
//! session's active one, so a turn that was cancelled (or whose session was
//! deleted) can finish quietly without touching newer state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Instrument;

use sw_domain::config::DegradationStep;
use sw_domain::stream::{AgentEvent, InvokeOutcome};
use sw_domain::trace::TraceEvent;
use sw_invoker::InvokeRequest;
use sw_sessions::{ChatStatus, Message, Session, SessionMode};

use super::events::SessionEvent;
use super::manager::SessionManager;
use super::prompt::{build_turn_prompt, recent_window, TurnPrompt};
use super::quota::EnforcementLevel;

const TOO_LONG_NOTE: &str = "_The conversation grew too long for the agent to resume. \
     Your next message starts a fresh conversation built from recent history._";
const RESUME_FAILED_NOTE: &str = "_The previous agent conversation could not be resumed. \
     Your next message starts a fresh conversation built from recent history._";
const NO_OUTPUT_TEXT: &str = "(no response)";
const TITLE_CHARS: usize = 60;

/// Everything the turn task needs once the session lock is released.
pub(super) struct PreparedTurn {
    session_id: String,
    turn_id: String,
    placeholder_id: String,
    mode: SessionMode,
    request: InvokeRequest,
}

/// What the agent stream produced.
struct StreamResult {
    outcome: InvokeOutcome,
    input_tokens: Option<u64>,
    /// The agent never ran, or the pipeline broke mid-stream.
    fatal: bool,
}

#[derive(Debug, PartialEq)]
enum Failure {
    /// Context overflow: drop the resumable handle and start fresh.
    TooLong,
    /// Exit code 1 while resuming: the handle is no longer valid.
    ResumeFailed,
    Raw(String),
}

fn classify_failure(outcome: &InvokeOutcome, had_handle: bool) -> Failure {
    let error = outcome
        .error
        .clone()
        .unwrap_or_else(|| "agent failed without an error message".into());
    if error.to_lowercase().contains("too long") {
        Failure::TooLong
    } else if had_handle && outcome.exit_code == Some(1) {
        Failure::ResumeFailed
    } else {
        Failure::Raw(error)
    }
}

fn title_from(text: &str) -> String {
    let line = text.lines().next().unwrap_or(text).trim();
    match line.char_indices().nth(TITLE_CHARS) {
        Some((idx, _)) => format!("{}…", &line[..idx]),
        None => line.to_owned(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn start (session lock held)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl SessionManager {
    /// Record `text` and prepare the invocation. Returns `None` when the
    /// quota allocator refuses the turn; the user message stays in the
    /// history either way.
    pub(super) fn begin_turn(
        &self,
        session: &mut Session,
        text: String,
        mode: SessionMode,
    ) -> Option<PreparedTurn> {
        let session_id = session.id.clone();

        let user = Message::user(text.clone());
        if session.title.is_none() {
            session.title = Some(title_from(&text));
        }
        session.messages.push(user.clone());
        session.touch();
        self.emit(
            &session_id,
            SessionEvent::Message {
                session_id: session_id.clone(),
                message: user,
            },
        );

        // ── Admission ────────────────────────────────────────────────
        let workspace = session.attached_repo_ids.first().cloned();
        let check = self
            .allocator
            .check_budget_limits_for(workspace.as_deref(), None);
        if !check.allowed {
            let reason = check
                .reason
                .clone()
                .unwrap_or_else(|| "quota budget exhausted".into());
            TraceEvent::BudgetDenied {
                session_id: session_id.clone(),
                reason: reason.clone(),
            }
            .emit();
            self.emit(
                &session_id,
                SessionEvent::error(&session_id, "budget_blocked", reason),
            );
            session.chat_status = ChatStatus::Idle;
            self.emit_status(session);
            self.persist_if_saved(session);
            return None;
        }

        let mut mode = mode;
        let mut model = self.effective_model(session);
        let mut warn = check.enforcement == EnforcementLevel::Soft;
        for step in &check.active_degradations {
            match step {
                DegradationStep::SwitchModel { model_id } => model = Some(model_id.clone()),
                DegradationStep::RequirePlanMode => mode = SessionMode::Plan,
                DegradationStep::RequireConfirmation | DegradationStep::SuggestSplit => {
                    warn = true
                }
                DegradationStep::PauseQueue | DegradationStep::BlockNewSessions => {}
            }
        }
        if warn {
            self.emit(
                &session_id,
                SessionEvent::BudgetWarning {
                    session_id: session_id.clone(),
                    check,
                },
            );
        }

        // ── Running ──────────────────────────────────────────────────
        session.chat_status = ChatStatus::Running;
        self.emit_status(session);

        let prompt = self.build_prompt(session, &text);
        let prompt = match mode {
            SessionMode::Plan => self.invoker.plan_prompt(&prompt),
            SessionMode::Direct => prompt,
        };

        let placeholder = Message::placeholder();
        let placeholder_id = placeholder.id.clone();
        session.messages.push(placeholder.clone());
        self.emit(
            &session_id,
            SessionEvent::Message {
                session_id: session_id.clone(),
                message: placeholder,
            },
        );

        let turn_id = uuid::Uuid::new_v4().to_string();
        session.active_turn_id = Some(turn_id.clone());

        Some(PreparedTurn {
            session_id,
            turn_id,
            placeholder_id,
            mode,
            request: InvokeRequest {
                working_dir: session.working_dir.clone(),
                prompt,
                artifacts_dir: Some(session.artifacts_dir.clone()),
                resume_session_id: session.agent_session_id.clone(),
                model,
            },
        })
    }

    /// Resumed turns send the text alone; fresh ones carry the preamble,
    /// the latest summary and a bounded window of recent history.
    fn build_prompt(&self, session: &Session, text: &str) -> String {
        if session.agent_session_id.is_some() {
            return text.to_owned();
        }
        let summaries = self.context.summaries(&session.id);
        let covered: HashSet<&str> = summaries
            .iter()
            .flat_map(|s| s.covered_message_ids.iter().map(String::as_str))
            .collect();
        // The message just recorded for this turn is the current request.
        let prior = &session.messages[..session.messages.len().saturating_sub(1)];
        let history = recent_window(prior, &covered, self.config.history_exchanges);

        build_turn_prompt(&TurnPrompt {
            preamble: &self.config.system_preamble,
            text,
            history: &history,
            summaries: &summaries,
            attached_repos: &session.attached_repo_ids,
            max_message_length: self.context.config().max_message_length,
        })
    }

    pub(super) fn spawn_turn(self: &Arc<Self>, turn: PreparedTurn) {
        let span = tracing::info_span!(
            "turn",
            session_id = %turn.session_id,
            turn_id = %turn.turn_id,
        );
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_turn(turn).await }.instrument(span));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl SessionManager {
    async fn run_turn(self: Arc<Self>, turn: PreparedTurn) {
        let start = Instant::now();
        TraceEvent::TurnStarted {
            session_id: turn.session_id.clone(),
            turn_id: turn.turn_id.clone(),
            mode: turn.mode.as_str().to_owned(),
            resumed: turn.request.resume_session_id.is_some(),
            prompt_chars: turn.request.prompt.chars().count(),
        }
        .emit();

        let result = self.stream_turn(&turn).await;

        TraceEvent::TurnFinished {
            session_id: turn.session_id.clone(),
            turn_id: turn.turn_id.clone(),
            success: result.outcome.success,
            duration_ms: start.elapsed().as_millis() as u64,
            input_tokens: result.input_tokens,
        }
        .emit();

        self.finish_turn(&turn, result).await;
    }

    fn is_current(&self, turn: &PreparedTurn) -> bool {
        self.slot(&turn.session_id)
            .map(|slot| slot.lock().active_turn_id.as_deref() == Some(turn.turn_id.as_str()))
            .unwrap_or(false)
    }

    async fn stream_turn(&self, turn: &PreparedTurn) -> StreamResult {
        let run = match self.invoker.spawn(turn.request.clone()).await {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(error = %e, "agent failed to start");
                return StreamResult {
                    outcome: InvokeOutcome::failed(e.to_string(), None),
                    input_tokens: None,
                    fatal: true,
                };
            }
        };

        let handle = run.handle.clone();
        let registered = match self.slot(&turn.session_id) {
            Ok(slot) => {
                let session = slot.lock();
                let current =
                    session.active_turn_id.as_deref() == Some(turn.turn_id.as_str());
                if current {
                    self.processes.register(&turn.session_id, run.handle);
                }
                current
            }
            Err(_) => false,
        };
        if !registered {
            // Cancelled or deleted while the process was starting.
            handle.kill();
        }

        let mut events = run.events;
        let mut input_tokens = None;
        let outcome = loop {
            match events.recv().await {
                Some(AgentEvent::Text { content }) => self.on_text(turn, &content),
                Some(AgentEvent::ToolUse { tool_name, content }) => {
                    if self.is_current(turn) {
                        self.emit(
                            &turn.session_id,
                            SessionEvent::Activity {
                                session_id: turn.session_id.clone(),
                                tool_name,
                                content,
                            },
                        );
                    }
                }
                Some(AgentEvent::Result {
                    session_id, usage, ..
                }) => {
                    let total = usage.map(|u| u.total_input()).filter(|t| *t > 0);
                    if total.is_some() {
                        input_tokens = total;
                    }
                    self.on_result(turn, session_id, total);
                }
                Some(AgentEvent::Error { content }) => {
                    self.on_text(turn, &format!("\n\n[agent error] {content}"));
                }
                Some(AgentEvent::Exit { outcome }) => break outcome,
                None => {
                    break InvokeOutcome::failed("agent stream closed before exit", None);
                }
            }
        };

        self.processes.remove(&turn.session_id, handle.id());
        StreamResult {
            outcome,
            input_tokens,
            fatal: false,
        }
    }

    fn on_text(&self, turn: &PreparedTurn, content: &str) {
        let Ok(slot) = self.slot(&turn.session_id) else {
            return;
        };
        let mut session = slot.lock();
        if session.active_turn_id.as_deref() != Some(turn.turn_id.as_str()) {
            return;
        }
        if session.append_chunk(&turn.placeholder_id, content) {
            self.emit(
                &turn.session_id,
                SessionEvent::Chunk {
                    session_id: turn.session_id.clone(),
                    message_id: turn.placeholder_id.clone(),
                    content: content.to_owned(),
                },
            );
        }
    }

    /// Capture the resumable handle and the reported usage, then publish the
    /// new context state.
    fn on_result(
        &self,
        turn: &PreparedTurn,
        agent_session_id: Option<String>,
        input_tokens: Option<u64>,
    ) {
        let Ok(slot) = self.slot(&turn.session_id) else {
            return;
        };
        let mut session = slot.lock();
        if session.active_turn_id.as_deref() != Some(turn.turn_id.as_str()) {
            return;
        }
        if let Some(id) = agent_session_id {
            session.agent_session_id = Some(id);
        }
        let Some(tokens) = input_tokens else {
            return;
        };

        self.context.update_actual_usage(&turn.session_id, tokens);
        let state = self.context.get_context_state(
            &turn.session_id,
            &session.messages,
            turn.request.model.as_deref(),
        );
        self.emit(
            &turn.session_id,
            SessionEvent::ContextStateUpdate {
                session_id: turn.session_id.clone(),
                state: state.clone(),
            },
        );
        if !session.split_suggested && self.context.should_suggest_split(&state) {
            session.split_suggested = true;
            tracing::info!(utilization = state.utilization, "split suggested");
            self.emit(
                &turn.session_id,
                SessionEvent::ContextSplitSuggested {
                    session_id: turn.session_id.clone(),
                    state,
                },
            );
        }
    }

    /// Settle the session after the agent exits, then kick off the
    /// follow-ups: quota sample, automatic summarization, queue drain.
    async fn finish_turn(self: &Arc<Self>, turn: &PreparedTurn, result: StreamResult) {
        let Ok(slot) = self.slot(&turn.session_id) else {
            return;
        };

        let (summarize, drain) = {
            let mut session = slot.lock();
            if session.active_turn_id.as_deref() != Some(turn.turn_id.as_str()) {
                tracing::debug!("turn superseded, leaving session untouched");
                return;
            }
            session.active_turn_id = None;

            let note = if result.outcome.success {
                None
            } else {
                let failure =
                    classify_failure(&result.outcome, session.agent_session_id.is_some());
                tracing::warn!(
                    error = ?result.outcome.error,
                    exit_code = ?result.outcome.exit_code,
                    ?failure,
                    "turn failed"
                );
                Some(match failure {
                    Failure::TooLong => {
                        session.agent_session_id = None;
                        TOO_LONG_NOTE.to_owned()
                    }
                    Failure::ResumeFailed => {
                        session.agent_session_id = None;
                        RESUME_FAILED_NOTE.to_owned()
                    }
                    Failure::Raw(error) => {
                        self.emit(
                            &turn.session_id,
                            SessionEvent::error(&turn.session_id, "agent", error.clone()),
                        );
                        format!("[error] {error}")
                    }
                })
            };

            if let Some(message) = session.message_mut(&turn.placeholder_id) {
                if let Some(note) = note {
                    if !message.content.trim().is_empty() {
                        message.content.push_str("\n\n");
                    }
                    message.content.push_str(&note);
                }
                message.is_streaming = false;
                if message.content.trim().is_empty() {
                    message.content = NO_OUTPUT_TEXT.to_owned();
                }
            }
            session.chat_status = if result.fatal {
                ChatStatus::Error
            } else {
                ChatStatus::Idle
            };
            session.touch();

            self.emit(
                &turn.session_id,
                SessionEvent::MessageComplete {
                    session_id: turn.session_id.clone(),
                    message_id: turn.placeholder_id.clone(),
                },
            );
            self.emit_status(&session);
            self.persist_if_saved(&session);

            let state = self.context.get_context_state(
                &turn.session_id,
                &session.messages,
                turn.request.model.as_deref(),
            );
            let summarize = self.context.should_summarize(&state);
            let drain =
                session.chat_status == ChatStatus::Idle && !session.message_queue.is_empty();
            (summarize, drain)
        };

        if let Some(source) = &self.quota_source {
            if let Err(e) = self.allocator.record_utilization_sample(source.as_ref()).await {
                tracing::warn!(error = %e, "quota sample after turn failed");
            }
        }

        if summarize {
            let manager = Arc::clone(self);
            let session_id = turn.session_id.clone();
            tokio::spawn(
                async move {
                    match manager.summarize_session(&session_id).await {
                        Ok(summary) => tracing::info!(
                            covered = summary.covered_message_ids.len(),
                            "automatic summarization finished"
                        ),
                        Err(e) => tracing::warn!(error = %e, "automatic summarization failed"),
                    }
                }
                .in_current_span(),
            );
        }

        if drain {
            self.schedule_drain(&turn.session_id);
        }
    }

    /// Start the queue head after `drain_delay_ms`, giving subscribers a
    /// moment to see the session settle first.
    pub(super) fn schedule_drain(self: &Arc<Self>, session_id: &str) {
        let manager = Arc::clone(self);
        let session_id = session_id.to_owned();
        let delay = Duration::from_millis(self.config.drain_delay_ms);
        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = manager.drain_queue(&session_id) {
                    tracing::debug!(error = %e, "queue drain skipped");
                }
            }
            .in_current_span(),
        );
    }
}
