//! `slipway run`: one-shot execution command.
//!
//! Sends a single message, streams the reply to stdout, and exits. Useful
//! for scripting, piping, and quick CLI interactions.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use sw_domain::config::Config;
use sw_sessions::ChatStatus;

use super::render::print_event;
use crate::runtime::SessionEvent;

/// Execute a single turn and print the response.
pub async fn run(
    config: Arc<Config>,
    message: String,
    session: Option<String>,
    json_output: bool,
    save: bool,
    offline: bool,
) -> anyhow::Result<()> {
    // 1. Boot the runtime (without background tasks).
    let state = super::build_state(config, offline)?;

    // 2. One fresh reading so admission has something to judge by.
    if let Err(e) = state.sample_quota().await {
        tracing::warn!(error = %e, "quota sample failed, admitting without a reading");
    }

    // 3. Resolve or create the session.
    let session_id = match session {
        Some(id) => {
            state
                .sessions
                .get_session(&id)
                .with_context(|| format!("no saved idea {id}"))?;
            id
        }
        None => state.sessions.create_session()?.id,
    };

    // 4. Subscribe before sending so no event is missed.
    let mut rx = state
        .sessions
        .subscribe(&session_id)
        .context("session events unavailable")?;
    state.sessions.send_message(&session_id, &message)?;

    // 5. Drain events until the session settles.
    let mut exit_code: i32 = 0;
    let mut collected: Vec<SessionEvent> = Vec::new();

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let settled = match &event {
            SessionEvent::Status { chat_status, .. } => *chat_status != ChatStatus::Running,
            _ => false,
        };
        if matches!(
            &event,
            SessionEvent::Status { chat_status: ChatStatus::Error, .. }
                | SessionEvent::Error { .. }
        ) {
            exit_code = 1;
        }

        if json_output {
            collected.push(event);
        } else {
            print_event(&event);
        }

        if settled && !state.sessions.get_session(&session_id)?.is_running() {
            break;
        }
    }

    // 6. In JSON mode, serialize all collected events to stdout.
    if json_output {
        let json = serde_json::to_string_pretty(&collected)
            .map_err(|e| anyhow::anyhow!("serializing events: {e}"))?;
        println!("{json}");
    }

    // 7. Keep the conversation if asked to.
    if save {
        let saved = state.sessions.save_session(&session_id)?;
        eprintln!("saved as {}", saved.id);
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}
