//! Terminal rendering of session events and status reports.
//!
//! Assistant text goes to stdout; everything else is dimmed on stderr so
//! piped output stays clean.

use std::io::Write;

use sw_sessions::{ChatStatus, Role};

use crate::runtime::quota::{AllocatorSnapshot, BurnLabel};
use crate::runtime::{ContextState, SessionEvent};

const DIM: &str = "\x1B[2m";
const RED: &str = "\x1B[31m";
const YELLOW: &str = "\x1B[33m";
const RESET: &str = "\x1B[0m";

/// Print `event`. Returns `true` once the session has settled (status is
/// no longer running).
pub fn print_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::Chunk { content, .. } => {
            print!("{content}");
            std::io::stdout().flush().ok();
        }
        SessionEvent::Message { message, .. } if message.role == Role::Assistant => {
            if !message.is_streaming && !message.content.is_empty() {
                println!("{}", message.content);
            }
        }
        SessionEvent::Message { .. } => {}
        SessionEvent::MessageComplete { .. } => {
            println!();
            println!();
        }
        SessionEvent::Activity { tool_name, .. } => {
            eprintln!("{DIM}[tool: {tool_name}]{RESET}");
        }
        SessionEvent::Error { kind, message, .. } => {
            eprintln!("{RED}error ({kind}): {message}{RESET}");
        }
        SessionEvent::Status { chat_status, .. } => {
            return *chat_status != ChatStatus::Running;
        }
        SessionEvent::ContextStateUpdate { state, .. } => {
            eprintln!("{DIM}{}{RESET}", context_line(state));
        }
        SessionEvent::ContextSplitSuggested { state, .. } => {
            eprintln!(
                "{YELLOW}context is {:.0}% full; consider /new to start a fresh session{RESET}",
                state.utilization * 100.0
            );
        }
        SessionEvent::QueueUpdate { queue, .. } => {
            if !queue.is_empty() {
                eprintln!("{DIM}[{} queued]{RESET}", queue.len());
            }
        }
        SessionEvent::BudgetWarning { check, .. } => {
            let reason = check.reason.as_deref().unwrap_or("quota usage is elevated");
            eprintln!("{YELLOW}budget: {reason}{RESET}");
            for step in &check.active_degradations {
                eprintln!("{YELLOW}  active: {}{RESET}", step.label());
            }
        }
        SessionEvent::QueuePaused {
            five_hour_pct,
            pending,
            ..
        } => {
            let pct = five_hour_pct
                .map(|p| format!("{p:.1}%"))
                .unwrap_or_else(|| "unknown".into());
            eprintln!("{YELLOW}queue paused ({pending} pending, 5h usage {pct}){RESET}");
        }
    }
    false
}

pub fn context_line(state: &ContextState) -> String {
    format!(
        "context: {} / {} tokens ({:.1}%), {} verbatim, {} summarized, {} summaries, {:?}",
        state.effective_tokens,
        state.max_prompt_tokens,
        state.utilization * 100.0,
        state.verbatim_count,
        state.summarized_count,
        state.summary_count,
        state.summarization_status,
    )
}

pub fn print_snapshot(snapshot: &AllocatorSnapshot) {
    if !snapshot.enabled {
        println!("allocator: disabled");
        return;
    }
    match &snapshot.latest {
        Some(s) => println!(
            "utilization: 5h {:.1}%  7d {:.1}%  ({} samples)",
            s.five_hour_pct, s.seven_day_pct, snapshot.sample_count
        ),
        None => println!("utilization: no samples yet"),
    }

    let burn = &snapshot.burn_rate;
    let label = match burn.label {
        BurnLabel::Unknown => "unknown",
        BurnLabel::OnTrack => "on track",
        BurnLabel::Elevated => "elevated",
        BurnLabel::Critical => "critical",
    };
    println!(
        "burn rate: {label}, {:.1}%/h (5h), {:.1}%/h (7d), trend {:?}",
        burn.rate_per_hour_5h, burn.rate_per_hour_7d, burn.trend
    );
    if let Some(m) = burn.minutes_to_limit_5h {
        println!("  5h limit in ~{m:.0} min");
    }

    let cost = &snapshot.cost;
    println!(
        "per message: {:.2}% (5h), {:.2}% (7d), {:?} confidence",
        cost.per_message_5h, cost.per_message_7d, cost.confidence
    );

    let budget = &snapshot.budget;
    println!(
        "budget: {} ({:?}){}",
        if budget.allowed { "allowed" } else { "blocked" },
        budget.enforcement,
        budget
            .reason
            .as_deref()
            .map(|r| format!(": {r}"))
            .unwrap_or_default()
    );
    for step in &budget.active_degradations {
        println!("  active: {}", step.label());
    }
    if snapshot.queue_paused {
        println!("queue draining is paused");
    }
}
