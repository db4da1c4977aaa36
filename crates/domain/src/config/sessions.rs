use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Maximum number of messages waiting behind a running turn.
    #[serde(default = "d_10")]
    pub queue_capacity: usize,

    /// How many user/assistant exchanges are replayed into a fresh prompt.
    #[serde(default = "d_10")]
    pub history_exchanges: usize,

    /// Pause before the next queued message is started, in milliseconds.
    #[serde(default = "d_drain_delay_ms")]
    pub drain_delay_ms: u64,

    /// Text placed at the top of every non-resumed prompt.
    #[serde(default = "d_system_preamble")]
    pub system_preamble: String,

    /// Capacity of each session's event channel.
    #[serde(default = "d_event_buffer")]
    pub event_buffer: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            history_exchanges: 10,
            drain_delay_ms: d_drain_delay_ms(),
            system_preamble: d_system_preamble(),
            event_buffer: d_event_buffer(),
        }
    }
}

fn d_10() -> usize {
    10
}
fn d_drain_delay_ms() -> u64 {
    50
}
fn d_system_preamble() -> String {
    "You are helping the user explore a new project idea in a scratch workspace. \
     Prototype freely: files you write here may later be promoted into a real \
     repository. Keep answers focused on the current request."
        .into()
}
fn d_event_buffer() -> usize {
    256
}
