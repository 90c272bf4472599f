//! Context window management.
//!
//! The context log grows with every turn; once enough player messages
//! accumulate past the last summary marker, everything since that marker
//! is folded into one summary message and the log is rebuilt as
//! `[3 system messages, summary, trailing K messages]`. That strictly
//! non-growing bound is what keeps inference cost flat no matter how long
//! the story runs.

use ollama::{Message, Role};

/// The context log always starts with persona, story-details, and
/// cast-details system messages.
pub const SYSTEM_HEAD_LEN: usize = 3;

/// Content tag marking the synthetic summary message.
pub const SUMMARY_TAG: &str = "SUMMARY:";

/// Whether the log carries a summary marker at its fixed slot.
pub fn has_summary_marker(log: &[Message]) -> bool {
    log.get(SYSTEM_HEAD_LEN)
        .map(|m| m.role == Role::Assistant && m.content.starts_with(SUMMARY_TAG))
        .unwrap_or(false)
}

/// True iff at least `threshold` user messages exist past the summary
/// marker (or past the system head when no marker exists yet).
pub fn should_compress(log: &[Message], threshold: usize) -> bool {
    if log.len() < SYSTEM_HEAD_LEN {
        return false;
    }
    log[SYSTEM_HEAD_LEN..]
        .iter()
        .filter(|m| m.role == Role::User)
        .count()
        >= threshold
}

/// Flatten everything since the last marker into one text block for the
/// summarizer, prefixed with the prior summary when one exists.
pub fn compression_input(log: &[Message]) -> String {
    let start = segment_start(log);

    let body = log[start.min(log.len())..]
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    if has_summary_marker(log) {
        let prior = log[SYSTEM_HEAD_LEN]
            .content
            .trim_start_matches(SUMMARY_TAG)
            .trim();
        if !prior.is_empty() {
            return format!("PREVIOUS SUMMARY: {prior}\n\n{body}");
        }
    }
    body
}

/// The summarizer conversation for a flattened transcript.
pub fn summarizer_messages(transcript: String) -> Vec<Message> {
    vec![
        Message::system(include_str!("prompts/summarizer.txt")),
        Message::user(transcript),
    ]
}

/// Rebuild the log after compression: the system head, the new summary
/// message, then the trailing `keep_recent` messages of the old log (or
/// the whole post-marker segment when it is shorter).
pub fn rebuild_log(log: &[Message], summary: &str, keep_recent: usize) -> Vec<Message> {
    let start = segment_start(log);

    let mut rebuilt: Vec<Message> = log[..SYSTEM_HEAD_LEN.min(log.len())].to_vec();
    rebuilt.push(Message::assistant(format!("{SUMMARY_TAG} {summary}")));

    let tail = &log[start.min(log.len())..];
    if tail.len() > keep_recent {
        rebuilt.extend_from_slice(&tail[tail.len() - keep_recent..]);
    } else {
        rebuilt.extend_from_slice(tail);
    }

    rebuilt
}

fn segment_start(log: &[Message]) -> usize {
    if has_summary_marker(log) {
        SYSTEM_HEAD_LEN + 1
    } else {
        SYSTEM_HEAD_LEN
    }
}
