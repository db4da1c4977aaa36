//! Prompt assembly for turns, summarization runs and promotion handoffs.

use std::collections::HashSet;

use sw_sessions::{Message, Role};

use super::context::ContextSummary;

pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Cap `s` at `max_chars` characters, marking the cut.
pub fn truncate_message(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{TRUNCATION_MARKER}", &s[..idx]),
        None => s.to_owned(),
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

/// Inputs for a prompt that starts a fresh agent conversation.
pub struct TurnPrompt<'a> {
    pub preamble: &'a str,
    pub text: &'a str,
    /// Prior settled messages, oldest first.
    pub history: &'a [&'a Message],
    pub summaries: &'a [ContextSummary],
    /// Listed only on the first turn of a session.
    pub attached_repos: &'a [String],
    pub max_message_length: usize,
}

/// The last `exchanges` user/assistant pairs of settled messages that no
/// summary covers.
pub fn recent_window<'a>(
    messages: &'a [Message],
    covered: &HashSet<&str>,
    exchanges: usize,
) -> Vec<&'a Message> {
    let eligible: Vec<&Message> = messages
        .iter()
        .filter(|m| !m.is_streaming && !covered.contains(m.id.as_str()))
        .collect();
    let keep = exchanges * 2;
    eligible[eligible.len().saturating_sub(keep)..].to_vec()
}

/// Build the prompt for a non-resumed turn: preamble first, the user's
/// text last.
pub fn build_turn_prompt(p: &TurnPrompt<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    let preamble = p.preamble.trim();
    if !preamble.is_empty() {
        sections.push(preamble.to_owned());
    }

    if let Some(summary) = p.summaries.last() {
        sections.push(format!(
            "## Summary of earlier conversation\n{}",
            summary.text.trim()
        ));
    }

    if p.history.is_empty() && !p.attached_repos.is_empty() {
        let mut repos = String::from("## Attached repositories\n");
        for repo in p.attached_repos {
            repos.push_str("- ");
            repos.push_str(repo);
            repos.push('\n');
        }
        sections.push(repos.trim_end().to_owned());
    }

    if !p.history.is_empty() {
        sections.push(format!(
            "## Recent conversation\n{}",
            render_window(p.history, p.max_message_length)
        ));
    }

    if sections.is_empty() {
        return p.text.to_owned();
    }
    sections.push(format!("## Current request\n{}", p.text));
    sections.join("\n\n")
}

/// Render messages as `Role: content` lines. Each message is capped at
/// `max_chars`; the whole window at four times that, dropping the oldest
/// lines first.
fn render_window(history: &[&Message], max_chars: usize) -> String {
    let cap = max_chars.saturating_mul(4);
    let mut lines: Vec<String> = history
        .iter()
        .map(|m| {
            format!(
                "{}: {}",
                role_label(m.role),
                truncate_message(m.content.trim(), max_chars)
            )
        })
        .collect();

    let total = |lines: &[String]| lines.iter().map(|l| l.chars().count() + 1).sum::<usize>();
    let mut dropped = false;
    while lines.len() > 1 && total(&lines) > cap {
        lines.remove(0);
        dropped = true;
    }
    let mut body = lines.join("\n");
    if body.chars().count() > cap {
        body = truncate_message(&body, cap);
        dropped = true;
    }
    if dropped {
        format!("{TRUNCATION_MARKER}\n{body}")
    } else {
        body
    }
}

/// Prompt asking the summarization model to fold `messages` (and the
/// previous summary, if any) into one summary.
pub fn summarization_prompt(
    messages: &[&Message],
    previous: Option<&ContextSummary>,
    max_message_length: usize,
) -> String {
    let mut conversation = String::new();
    for m in messages {
        conversation.push_str(role_label(m.role));
        conversation.push_str(": ");
        conversation.push_str(&truncate_message(m.content.trim(), max_message_length));
        conversation.push('\n');
    }
    let earlier = previous
        .map(|s| format!("EARLIER SUMMARY:\n{}\n\n", s.text.trim()))
        .unwrap_or_default();

    format!(
        "You are a conversation summarizer. Summarize the following conversation \
         history into a concise summary with these sections:\n\
         ## Project context\n\
         What is being built and why.\n\
         ## Key decisions\n\
         Choices made and what they ruled out.\n\
         ## Current state\n\
         What works, what was just changed, where the work stands.\n\
         ## Technical details\n\
         Files, commands, APIs, names and values that later turns will need.\n\
         ## Open items\n\
         Unanswered questions and next steps.\n\n\
         Be concise but preserve all actionable context. Write in present tense.\n\
         Reply with the summary only. Do not use any tools.\n\n\
         {earlier}CONVERSATION:\n{conversation}"
    )
}

/// Truncated transcript handed to the repository a session is promoted to.
pub fn handoff_summary(
    title: Option<&str>,
    messages: &[Message],
    per_message_chars: usize,
    max_chars: usize,
) -> String {
    let mut out = format!("# Handoff: {}\n\n", title.unwrap_or("untitled session"));
    for m in messages.iter().filter(|m| !m.is_streaming) {
        out.push_str(&format!(
            "**{}:** {}\n\n",
            role_label(m.role),
            truncate_message(m.content.trim(), per_message_chars)
        ));
    }
    let out = out.trim_end().to_owned();
    truncate_message(&out, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(role: Role, content: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            is_streaming: false,
            timestamp: Utc::now(),
        }
    }

    fn summary(text: &str) -> ContextSummary {
        ContextSummary {
            id: "sum".into(),
            created_at: Utc::now(),
            covered_message_ids: Vec::new(),
            token_estimate: 10,
            text: text.into(),
            model: "haiku".into(),
        }
    }

    fn prompt<'a>(text: &'a str, history: &'a [&'a Message]) -> TurnPrompt<'a> {
        TurnPrompt {
            preamble: "",
            text,
            history,
            summaries: &[],
            attached_repos: &[],
            max_message_length: 100,
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_message("héllo", 10), "héllo");
        assert_eq!(truncate_message("héllo", 2), format!("hé{TRUNCATION_MARKER}"));
    }

    #[test]
    fn preamble_leads_even_a_bare_first_turn() {
        let p = TurnPrompt {
            preamble: "Scratch workspace.",
            ..prompt("hi", &[])
        };
        assert_eq!(
            build_turn_prompt(&p),
            "Scratch workspace.\n\n## Current request\nhi"
        );
        assert_eq!(build_turn_prompt(&prompt("hi", &[])), "hi");
    }

    #[test]
    fn default_preamble_is_used() {
        let config = sw_domain::config::SessionsConfig::default();
        let p = TurnPrompt {
            preamble: &config.system_preamble,
            ..prompt("hi", &[])
        };
        let out = build_turn_prompt(&p);
        assert!(out.starts_with(config.system_preamble.trim()));
        assert!(out.ends_with("## Current request\nhi"));
    }

    #[test]
    fn history_and_summary_sections() {
        let a = msg(Role::User, "first question");
        let b = msg(Role::Assistant, "first answer");
        let history = [&a, &b];
        let summaries = [summary("old stuff"), summary("newest summary")];
        let p = TurnPrompt {
            preamble: "Be brief.",
            summaries: &summaries,
            ..prompt("next", &history)
        };
        let out = build_turn_prompt(&p);
        assert!(out.starts_with("Be brief.\n\n## Summary of earlier conversation\nnewest summary"));
        assert!(!out.contains("old stuff"));
        assert!(out.contains("User: first question\nAssistant: first answer"));
        assert!(out.ends_with("## Current request\nnext"));
    }

    #[test]
    fn repos_only_on_first_turn() {
        let repos = vec!["api-server".to_string()];
        let first = TurnPrompt {
            attached_repos: &repos,
            ..prompt("go", &[])
        };
        assert!(build_turn_prompt(&first).contains("- api-server"));

        let a = msg(Role::User, "earlier");
        let history = [&a];
        let later = TurnPrompt {
            attached_repos: &repos,
            ..prompt("go", &history)
        };
        assert!(!build_turn_prompt(&later).contains("api-server"));
    }

    #[test]
    fn window_drops_oldest_beyond_cap() {
        let long: Vec<Message> = (0..10)
            .map(|i| msg(Role::User, &format!("{i}{}", "x".repeat(60))))
            .collect();
        let history: Vec<&Message> = long.iter().collect();
        let rendered = render_window(&history, 50);
        assert!(rendered.starts_with(TRUNCATION_MARKER));
        assert!(rendered.chars().count() <= 200 + TRUNCATION_MARKER.chars().count() * 2 + 1);
        assert!(rendered.contains("User: 9"));
        assert!(!rendered.contains("User: 0"));
    }

    #[test]
    fn recent_window_skips_covered_and_streaming() {
        let msgs: Vec<Message> = (0..6)
            .map(|i| msg(if i % 2 == 0 { Role::User } else { Role::Assistant }, &i.to_string()))
            .collect();
        let mut with_placeholder = msgs.clone();
        let mut p = msg(Role::Assistant, "");
        p.is_streaming = true;
        with_placeholder.push(p);

        let covered: HashSet<&str> = [msgs[0].id.as_str()].into_iter().collect();
        let window = recent_window(&with_placeholder, &covered, 2);
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["2", "3", "4", "5"]);

        let all = recent_window(&with_placeholder, &covered, 10);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn summarization_prompt_includes_previous() {
        let a = msg(Role::User, "build a parser");
        let prev = summary("we chose nom");
        let out = summarization_prompt(&[&a], Some(&prev), 100);
        assert!(out.contains("EARLIER SUMMARY:\nwe chose nom"));
        assert!(out.ends_with("CONVERSATION:\nUser: build a parser\n"));
        for heading in [
            "## Project context",
            "## Key decisions",
            "## Current state",
            "## Technical details",
            "## Open items",
        ] {
            assert!(out.contains(heading), "missing {heading}");
        }
    }

    #[test]
    fn handoff_is_capped() {
        let msgs = vec![
            msg(Role::User, &"a".repeat(50)),
            msg(Role::Assistant, &"b".repeat(50)),
        ];
        let out = handoff_summary(Some("Parser"), &msgs, 10, 1000);
        assert!(out.starts_with("# Handoff: Parser"));
        assert!(out.contains(&format!("**User:** {}{TRUNCATION_MARKER}", "a".repeat(10))));

        let short = handoff_summary(None, &msgs, 1000, 30);
        assert!(short.ends_with(TRUNCATION_MARKER));
        assert_eq!(short.chars().count(), 30 + TRUNCATION_MARKER.chars().count());
    }
}
