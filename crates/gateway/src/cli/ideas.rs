//! `slipway ideas`: list saved sessions.

use std::sync::Arc;

use sw_domain::config::Config;

/// List saved ideas, most recently active first.
pub fn ideas(config: Arc<Config>) -> anyhow::Result<()> {
    let state = super::build_state(config, true)?;
    let sessions = state.sessions.list_sessions();
    if sessions.is_empty() {
        println!("no saved ideas");
        return Ok(());
    }
    for s in sessions {
        println!(
            "{}  {:>3} msgs  {}  {}",
            s.id,
            s.messages.len(),
            s.last_activity_at.format("%Y-%m-%d %H:%M"),
            s.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}
