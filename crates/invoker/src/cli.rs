//! Agent invoker backed by the agent CLI.
//!
//! Each run is one child process started with
//! `-p <prompt> --output-format stream-json --verbose`. A background
//! monitor task parses stdout into events, keeps a bounded stderr tail
//! for error reporting, and races process exit against the kill channel
//! and a wall-clock timeout. The monitor always sends a final `Exit`.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use sw_domain::config::AgentConfig;
use sw_domain::error::{Error, Result};
use sw_domain::stream::{AgentEvent, InvokeOutcome};

use crate::parse::StreamParser;
use crate::traits::{AgentInvoker, AgentRun, InvokeRequest, ProcessHandle};

/// Capacity of each run's event channel.
const EVENT_BUFFER: usize = 256;

/// How long to keep reading stdout after a kill. Grandchildren can hold
/// the pipe open past the child's death.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

pub struct CliInvoker {
    config: AgentConfig,
}

impl CliInvoker {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Command-line arguments for `request`, excluding the binary.
    pub fn build_args(&self, request: &InvokeRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_owned(),
            request.prompt.clone(),
            "--output-format".to_owned(),
            "stream-json".to_owned(),
            "--verbose".to_owned(),
        ];
        if let Some(model) = &request.model {
            args.push("--model".to_owned());
            args.push(model.clone());
        }
        if let Some(resume) = &request.resume_session_id {
            args.push("--resume".to_owned());
            args.push(resume.clone());
        }
        if let Some(dir) = &request.artifacts_dir {
            args.push("--add-dir".to_owned());
            args.push(dir.display().to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait::async_trait]
impl AgentInvoker for CliInvoker {
    async fn spawn(&self, request: InvokeRequest) -> Result<AgentRun> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.build_args(&request))
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            Error::Agent(format!("failed to start {}: {e}", self.config.binary))
        })?;
        let (handle, kill_rx) = ProcessHandle::new(child.id());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tracing::debug!(
            handle = handle.id(),
            pid = ?handle.pid(),
            resume = request.resume_session_id.is_some(),
            model = ?request.model,
            "agent process spawned"
        );

        spawn_monitor(
            child,
            tx,
            kill_rx,
            Duration::from_secs(self.config.turn_timeout_sec),
            self.config.stderr_max_bytes,
            handle.id().to_owned(),
        );

        Ok(AgentRun { handle, events: rx })
    }
}

// ── Private ─────────────────────────────────────────────────────────

/// Keeps the last `max_bytes` of stderr.
struct StderrTail {
    text: String,
    max_bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        if self.text.len() > self.max_bytes {
            let mut cut = self.text.len() - self.max_bytes;
            while cut < self.text.len() && !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }
}

fn spawn_monitor(
    mut child: tokio::process::Child,
    tx: mpsc::Sender<AgentEvent>,
    mut kill_rx: mpsc::Receiver<()>,
    timeout: Duration,
    stderr_max_bytes: usize,
    handle_id: String,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    tokio::spawn(async move {
        // Stdout reader: every line goes through the stream parser.
        let tx_out = tx.clone();
        let mut stdout_task = tokio::spawn(async move {
            let mut parser = StreamParser::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    for event in parser.parse_line(&line) {
                        // Receiver gone: keep draining so the child never
                        // blocks on a full pipe.
                        let _ = tx_out.send(event).await;
                    }
                }
            }
            parser
        });

        let stderr_task = tokio::spawn(async move {
            let mut tail = StderrTail {
                text: String::new(),
                max_bytes: stderr_max_bytes,
            };
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tail.push_line(&line);
                }
            }
            tail.text
        });

        let outcome = tokio::select! {
            result = child.wait() => {
                let parser = stdout_task.await.unwrap_or_default();
                let stderr_text = stderr_task.await.unwrap_or_default();
                match result {
                    Ok(status) if status.success() && parser.last_error().is_none() => {
                        InvokeOutcome::ok()
                    }
                    Ok(status) => {
                        let error = parser
                            .last_error()
                            .map(str::to_owned)
                            .or_else(|| non_empty(stderr_text.trim()))
                            .unwrap_or_else(|| format!("agent exited with {status}"));
                        InvokeOutcome::failed(error, status.code())
                    }
                    Err(e) => InvokeOutcome::failed(format!("process error: {e}"), None),
                }
            }
            _ = kill_rx.recv() => {
                let _ = child.kill().await;
                let _ = tokio::time::timeout(DRAIN_GRACE, &mut stdout_task).await;
                stdout_task.abort();
                stderr_task.abort();
                InvokeOutcome::failed("killed", None)
            }
            _ = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                let _ = tokio::time::timeout(DRAIN_GRACE, &mut stdout_task).await;
                stdout_task.abort();
                stderr_task.abort();
                InvokeOutcome::failed(format!("timed out after {}s", timeout.as_secs()), None)
            }
        };

        tracing::debug!(
            handle = %handle_id,
            success = outcome.success,
            exit_code = ?outcome.exit_code,
            "agent process monitor completed"
        );
        let _ = tx.send(AgentEvent::Exit { outcome }).await;
    });
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}
