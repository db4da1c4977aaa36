//! Agent invocation for Slipway.
//!
//! An invoker starts one run of the external agent and hands back a kill
//! handle plus a channel of [`AgentEvent`](sw_domain::stream::AgentEvent)s
//! that always ends with an `Exit`:
//! - [`CliInvoker`]: spawns the agent CLI and parses its `stream-json` output
//! - [`ScriptedInvoker`]: replays canned scripts (tests and `--offline` runs)

pub mod cli;
pub mod parse;
pub mod plan;
pub mod scripted;
pub mod traits;

pub use cli::CliInvoker;
pub use scripted::{Script, ScriptedInvoker};
pub use traits::{AgentInvoker, AgentRun, InvokeRequest, ProcessHandle};
