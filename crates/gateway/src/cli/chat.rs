//! `slipway chat`: interactive REPL.
//!
//! Each line is sent to the current session and the session's events are
//! streamed back until it settles. Ctrl+C during a turn cancels it.
//! Slash-commands cover the rest of the session lifecycle.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use sw_domain::config::Config;
use sw_sessions::SessionMode;

use super::render::{context_line, print_event, print_snapshot};
use crate::bootstrap;
use crate::runtime::{PromoteOptions, SessionEvent};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(config: Arc<Config>, session: Option<String>, offline: bool) -> anyhow::Result<()> {
    let state = super::build_state(config, offline)?;
    let tasks = bootstrap::spawn_background_tasks(&state);

    let mut session_id = match session {
        Some(id) => {
            state
                .sessions
                .get_session(&id)
                .with_context(|| format!("no saved idea {id}"))?;
            id
        }
        None => state.sessions.create_session()?.id,
    };

    let history_path = dirs::home_dir()
        .unwrap_or_default()
        .join(".slipway")
        .join("chat_history.txt");
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut rl = rustyline::DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    eprintln!("Slipway chat{}", if offline { " (offline echo agent)" } else { "" });
    eprintln!(
        "Session: {}  |  Type /help for commands, Ctrl+D to exit",
        short(&session_id)
    );
    eprintln!();

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(&line).ok();

                if trimmed.starts_with('/') {
                    match handle_slash_command(&state, &mut session_id, trimmed).await {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => eprintln!("\x1B[31merror: {e}\x1B[0m"),
                    }
                    continue;
                }

                if let Err(e) = send_and_stream(&state, &session_id, trimmed).await {
                    eprintln!("\x1B[31merror: {e}\x1B[0m");
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                eprintln!("(Use Ctrl+D or /exit to quit)");
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("\x1B[31mreadline error: {e}\x1B[0m");
                break;
            }
        }
    }

    rl.save_history(&history_path).ok();
    state.shutdown.cancel();
    for task in tasks {
        task.await.ok();
    }
    eprintln!("Goodbye!");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn send_and_stream(state: &AppState, session_id: &str, text: &str) -> anyhow::Result<()> {
    let mut rx = state
        .sessions
        .subscribe(session_id)
        .context("session events unavailable")?;
    state.sessions.send_message(session_id, text)?;
    wait_until_settled(state, session_id, &mut rx).await
}

/// Print events until the session is idle with nothing queued, the queue
/// is held by quota pressure, or the stream closes.
pub(crate) async fn wait_until_settled(
    state: &AppState,
    session_id: &str,
    rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(paused @ SessionEvent::QueuePaused { .. }) => {
                    print_event(&paused);
                    return Ok(());
                }
                Ok(event) => {
                    if print_event(&event) {
                        let session = state.sessions.get_session(session_id)?;
                        if !session.is_running() && session.message_queue.is_empty() {
                            return Ok(());
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => eprintln!("\x1B[2m(missed {n} events)\x1B[0m"),
                Err(RecvError::Closed) => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                if state.sessions.cancel_active(session_id)? {
                    eprintln!("(cancelled)");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slash command handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process a slash command. Returns `true` if the REPL should exit.
async fn handle_slash_command(
    state: &AppState,
    session_id: &mut String,
    input: &str,
) -> anyhow::Result<bool> {
    let (cmd, arg) = match input.split_once(' ') {
        Some((c, a)) => (c, Some(a.trim()).filter(|a| !a.is_empty())),
        None => (input, None),
    };
    let sessions = &state.sessions;

    match cmd {
        "/exit" | "/quit" => return Ok(true),

        "/new" => {
            *session_id = sessions.create_session()?.id;
            eprintln!("New session: {}", short(session_id));
        }

        "/sessions" => {
            for s in sessions.list_sessions() {
                let marker = if s.id == *session_id { "*" } else { " " };
                eprintln!(
                    "{marker} {}  {:<10} {:<8} {:>3} msgs  {}",
                    short(&s.id),
                    format!("{:?}", s.status).to_lowercase(),
                    format!("{:?}", s.chat_status).to_lowercase(),
                    s.messages.len(),
                    s.title.as_deref().unwrap_or("(untitled)")
                );
            }
        }

        "/switch" => {
            let prefix = arg.context("usage: /switch <id prefix>")?;
            let found = sessions
                .list_sessions()
                .into_iter()
                .find(|s| s.id.starts_with(prefix))
                .with_context(|| format!("no session starting with {prefix}"))?;
            *session_id = found.id;
            eprintln!("Switched to {}", short(session_id));
        }

        "/save" => {
            let s = sessions.save_session(session_id)?;
            eprintln!("Saved {} ({} messages)", short(&s.id), s.messages.len());
        }

        "/delete" => {
            sessions.delete_session(session_id)?;
            *session_id = sessions.create_session()?.id;
            eprintln!("Deleted. New session: {}", short(session_id));
        }

        "/mode" => {
            let mode: SessionMode = arg.context("usage: /mode plan|direct")?.parse()?;
            sessions.set_mode(session_id, mode)?;
            eprintln!("Mode: {}", mode.as_str());
        }

        "/model" => {
            let model = arg.filter(|m| *m != "default").map(str::to_owned);
            sessions.set_model(session_id, model.clone())?;
            eprintln!("Model: {}", model.as_deref().unwrap_or("(default)"));
        }

        "/attach" => {
            let repo = arg.context("usage: /attach <repo>")?;
            sessions.attach_repo(session_id, repo)?;
            eprintln!("Attached {repo}");
        }

        "/cancel" => {
            if !sessions.cancel_active(session_id)? {
                eprintln!("Nothing running");
            }
        }

        "/context" => {
            eprintln!("{}", context_line(&sessions.context_state(session_id)?));
        }

        "/summarize" => {
            let summary = sessions.summarize_session(session_id).await?;
            eprintln!(
                "Summarized {} messages (~{} tokens):\n{}",
                summary.covered_message_ids.len(),
                summary.token_estimate,
                summary.text
            );
        }

        "/quota" => {
            if let Err(e) = state.sample_quota().await {
                eprintln!("\x1B[33mquota source: {e}\x1B[0m");
            }
            print_snapshot(&state.allocator.snapshot());
        }

        "/queue" => match arg {
            Some(text) => sessions.enqueue(session_id, text)?,
            None => {
                let session = sessions.get_session(session_id)?;
                for (i, q) in session.message_queue.iter().enumerate() {
                    eprintln!("{:>2}. [{}] {}", i + 1, q.mode.as_str(), q.content);
                }
                let cost = state.allocator.estimate_queue_cost(session.message_queue.len());
                eprintln!(
                    "{} queued, ~{:.1}% of the 5h quota, projected {:.1}%",
                    cost.message_count, cost.total_5h, cost.projected_5h
                );
                if let Some(n) = cost.would_exceed_at {
                    eprintln!("\x1B[33mmessage {n} would cross the session cap\x1B[0m");
                }
            }
        },

        "/drain" => {
            let mut rx = sessions
                .subscribe(session_id)
                .context("session events unavailable")?;
            if sessions.drain_queue(session_id)? {
                wait_until_settled(state, session_id, &mut rx).await?;
            } else {
                eprintln!("Nothing to drain");
            }
        }

        "/promote" => {
            let promotion = sessions
                .promote(
                    session_id,
                    PromoteOptions {
                        name: arg.map(str::to_owned),
                        transfer_history: true,
                    },
                )
                .await?;
            eprintln!("Promoted to {}", promotion.repo_path.display());
            if let Some(handoff) = promotion.handoff {
                let path = promotion.repo_path.join("HANDOFF.md");
                std::fs::write(&path, handoff)
                    .with_context(|| format!("writing {}", path.display()))?;
                eprintln!("Handoff written to {}", path.display());
            }
        }

        "/help" => {
            eprintln!("Commands:");
            eprintln!("  /new                 Start a new session");
            eprintln!("  /sessions            List sessions");
            eprintln!("  /switch <prefix>     Switch to another session");
            eprintln!("  /save                Save the session as an idea");
            eprintln!("  /delete              Delete the session and start a new one");
            eprintln!("  /mode plan|direct    Set the session mode");
            eprintln!("  /model <name>        Override the model (\"default\" to clear)");
            eprintln!("  /attach <repo>       Attach a repository");
            eprintln!("  /cancel              Cancel the running turn");
            eprintln!("  /context             Show context-window usage");
            eprintln!("  /summarize           Summarize older messages now");
            eprintln!("  /quota               Sample and show quota status");
            eprintln!("  /queue [text]        Show the queue, or queue a message");
            eprintln!("  /drain               Start the next queued message");
            eprintln!("  /promote [name]      Promote the session to a repository");
            eprintln!("  /exit, /quit         Exit");
        }

        other => {
            eprintln!("Unknown command: {other}  (type /help for a list)");
        }
    }

    Ok(false)
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
