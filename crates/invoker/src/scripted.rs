//! In-process invoker that replays canned scripts instead of spawning a
//! process. Used by the integration tests and by `slipway chat --offline`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};

use sw_domain::error::{Error, Result};
use sw_domain::stream::{AgentEvent, InvokeOutcome, TokenUsage};

use crate::traits::{AgentInvoker, AgentRun, InvokeRequest, ProcessHandle};

/// One canned run: events to emit, then the exit outcome.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub events: Vec<AgentEvent>,
    pub outcome: InvokeOutcome,
    /// Wait for [`ScriptedInvoker::release`] (or a kill) before exiting.
    pub hold: bool,
    /// Fail at spawn time with this message.
    pub spawn_error: Option<String>,
}

impl Script {
    /// A successful run that answers `text`.
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            events: vec![
                AgentEvent::Text {
                    content: text.into(),
                },
                AgentEvent::Result {
                    session_id: None,
                    usage: None,
                    model: None,
                },
            ],
            outcome: InvokeOutcome::ok(),
            ..Default::default()
        }
    }

    /// A run that exits non-zero with `error` and no output.
    pub fn failure(error: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            events: Vec::new(),
            outcome: InvokeOutcome::failed(error, exit_code),
            ..Default::default()
        }
    }

    pub fn spawn_error(error: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Report `id` as the agent-side conversation id.
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.result_event(|session_id, _| *session_id = Some(id));
        self
    }

    /// Report `input_tokens` of prompt usage.
    pub fn with_input_tokens(mut self, input_tokens: u64) -> Self {
        self.result_event(|_, usage| {
            *usage = Some(TokenUsage {
                input_tokens,
                ..Default::default()
            })
        });
        self
    }

    pub fn held(mut self) -> Self {
        self.hold = true;
        self
    }

    fn result_event(&mut self, f: impl FnOnce(&mut Option<String>, &mut Option<TokenUsage>)) {
        let has_result = self
            .events
            .iter()
            .any(|e| matches!(e, AgentEvent::Result { .. }));
        if !has_result {
            self.events.push(AgentEvent::Result {
                session_id: None,
                usage: None,
                model: None,
            });
        }
        if let Some(AgentEvent::Result {
            session_id, usage, ..
        }) = self
            .events
            .iter_mut()
            .find(|e| matches!(e, AgentEvent::Result { .. }))
        {
            f(session_id, usage);
        }
    }
}

/// Invoker that pops one [`Script`] per spawn. With no script queued it
/// echoes the last line of the prompt back.
pub struct ScriptedInvoker {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<InvokeRequest>>,
    release: Arc<Semaphore>,
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Every request received so far, oldest first.
    pub fn requests(&self) -> Vec<InvokeRequest> {
        self.requests.lock().clone()
    }

    /// Let one held run finish.
    pub fn release(&self) {
        self.release.add_permits(1);
    }

    fn echo(request: &InvokeRequest) -> Script {
        let last = request
            .prompt
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim();
        Script::reply(format!("echo: {last}"))
    }
}

#[async_trait::async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn spawn(&self, request: InvokeRequest) -> Result<AgentRun> {
        self.requests.lock().push(request.clone());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::echo(&request));
        if let Some(error) = script.spawn_error {
            return Err(Error::Agent(error));
        }

        let (handle, mut kill_rx) = ProcessHandle::new(None);
        let (tx, rx) = mpsc::channel(64);
        let release = self.release.clone();

        tokio::spawn(async move {
            for event in script.events {
                let _ = tx.send(event).await;
            }
            let outcome = if script.hold {
                tokio::select! {
                    _ = kill_rx.recv() => InvokeOutcome::failed("killed", None),
                    permit = release.acquire_owned() => {
                        if let Ok(p) = permit {
                            p.forget();
                        }
                        script.outcome
                    }
                }
            } else {
                script.outcome
            };
            let _ = tx.send(AgentEvent::Exit { outcome }).await;
        });

        Ok(AgentRun { handle, events: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> InvokeRequest {
        InvokeRequest {
            working_dir: "/tmp".into(),
            prompt: prompt.into(),
            artifacts_dir: None,
            resume_session_id: None,
            model: None,
        }
    }

    async fn drain(mut run: AgentRun) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Some(ev) = run.events.recv().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn echo_when_no_script() {
        let inv = ScriptedInvoker::new();
        let run = inv.spawn(request("preamble\n\nhi there\n")).await.unwrap();
        let events = drain(run).await;
        assert_eq!(
            events[0],
            AgentEvent::Text {
                content: "echo: hi there".into()
            }
        );
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Exit { outcome }) if outcome.success
        ));
        assert_eq!(inv.requests().len(), 1);
    }

    #[tokio::test]
    async fn held_run_ends_on_kill() {
        let inv = ScriptedInvoker::new();
        inv.push(Script::reply("partial").held());
        let run = inv.spawn(request("x")).await.unwrap();
        assert!(run.handle.kill());
        let events = drain(run).await;
        match events.last() {
            Some(AgentEvent::Exit { outcome }) => {
                assert!(!outcome.success);
                assert_eq!(outcome.error.as_deref(), Some("killed"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn held_run_ends_on_release() {
        let inv = ScriptedInvoker::new();
        inv.push(Script::reply("done").with_session_id("conv-1").held());
        let run = inv.spawn(request("x")).await.unwrap();
        inv.release();
        let events = drain(run).await;
        assert!(events.contains(&AgentEvent::Result {
            session_id: Some("conv-1".into()),
            usage: None,
            model: None,
        }));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::Exit { outcome }) if outcome.success
        ));
    }

    #[tokio::test]
    async fn spawn_error_is_returned() {
        let inv = ScriptedInvoker::new();
        inv.push(Script::spawn_error("no binary"));
        assert!(matches!(
            inv.spawn(request("x")).await,
            Err(Error::Agent(_))
        ));
    }
}
