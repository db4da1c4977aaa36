use std::path::PathBuf;

use tokio::sync::mpsc;

use sw_domain::error::Result;
use sw_domain::stream::AgentEvent;

/// Everything needed to start one agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    pub working_dir: PathBuf,
    pub prompt: String,
    /// Extra directory the agent may write outputs to.
    pub artifacts_dir: Option<PathBuf>,
    /// Resume this agent-side conversation instead of starting fresh.
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
}

/// A running invocation: kill handle plus its event stream.
pub struct AgentRun {
    pub handle: ProcessHandle,
    pub events: mpsc::Receiver<AgentEvent>,
}

/// Kill handle for a running agent process.
///
/// Cloning is cheap; every clone signals the same monitor task.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: String,
    pid: Option<u32>,
    kill_tx: mpsc::Sender<()>,
}

impl ProcessHandle {
    /// Create a handle and the receiver its monitor listens on.
    pub fn new(pid: Option<u32>) -> (Self, mpsc::Receiver<()>) {
        let (kill_tx, kill_rx) = mpsc::channel(1);
        (
            Self {
                id: uuid::Uuid::new_v4().to_string(),
                pid,
                kill_tx,
            },
            kill_rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the monitor to kill the process. Returns `false` if the process
    /// already finished or a kill is already pending.
    pub fn kill(&self) -> bool {
        self.kill_tx.try_send(()).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.kill_tx.is_closed()
    }
}

/// Starts agent runs.
#[async_trait::async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn spawn(&self, request: InvokeRequest) -> Result<AgentRun>;

    /// Rewrite a user message so the agent plans instead of acting.
    fn plan_prompt(&self, text: &str) -> String {
        crate::plan::plan_prompt(text)
    }
}
