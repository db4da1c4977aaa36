use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where promoted sessions are materialized as repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    #[serde(default = "d_repos_root")]
    pub repos_root: PathBuf,
    /// Run `git init` in the new repository.
    #[serde(default = "d_true")]
    pub git_init: bool,
    /// Cap on the whole handoff summary.
    #[serde(default = "d_handoff_max_chars")]
    pub handoff_max_chars: usize,
    /// Cap on each message inside the handoff summary.
    #[serde(default = "d_handoff_message_chars")]
    pub handoff_message_chars: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            repos_root: d_repos_root(),
            git_init: true,
            handoff_max_chars: d_handoff_max_chars(),
            handoff_message_chars: d_handoff_message_chars(),
        }
    }
}

fn d_repos_root() -> PathBuf {
    PathBuf::from("./repos")
}
fn d_true() -> bool {
    true
}
fn d_handoff_max_chars() -> usize {
    12_000
}
fn d_handoff_message_chars() -> usize {
    1_500
}
