//! Conversation history diffing and parsing
//!
//! Upstream platforms resend the whole transcript on every update. Suffix
//! extraction recovers the part that has not been processed yet; tag parsing
//! turns it into structured messages. The two concerns are deliberately
//! separate so each can be tested on its own.

use crate::db::MessageRole;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Character cap for the unstructured fallback message.
const FALLBACK_MAX_CHARS: usize = 10_000;

static MESSAGE_TAGS: LazyLock<[(Regex, MessageRole); 3]> = LazyLock::new(|| {
    [
        (
            Regex::new(r"(?s)<USER>(.*?)</USER>").unwrap(),
            MessageRole::User,
        ),
        (
            Regex::new(r"(?s)<BOT>(.*?)</BOT>").unwrap(),
            MessageRole::Bot,
        ),
        (
            Regex::new(r"(?s)<SALE>(.*?)</SALE>").unwrap(),
            MessageRole::Sale,
        ),
    ]
});

/// A single parsed history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: f64,
}

/// Extract the unprocessed suffix of `current`.
///
/// When `processed` is empty or does not occur in `current` (the platform
/// rewrote or truncated the transcript), the whole string is treated as new.
pub fn diff<'a>(current: &'a str, processed: &str) -> &'a str {
    if processed.is_empty() {
        return current;
    }
    match current.find(processed) {
        Some(start) => current.get(start + processed.len()..).unwrap_or("").trim(),
        None => current,
    }
}

/// Parse a history fragment into chronologically ordered messages.
///
/// Ordering is by position in the source string, not by tag type. Text
/// outside the known tags is ignored. If nothing parses but the fragment is
/// non-empty, it is returned as a single `user` message capped at the last
/// 10,000 characters so an unstructured payload still reaches the AI.
pub fn parse(history: &str) -> Vec<ParsedMessage> {
    if history.trim().is_empty() {
        return Vec::new();
    }

    let timestamp = now_unix();
    let mut found: Vec<(usize, ParsedMessage)> = Vec::new();
    for (pattern, role) in MESSAGE_TAGS.iter() {
        for capture in pattern.captures_iter(history) {
            let whole = capture.get(0).unwrap();
            let content = capture.get(1).map_or("", |m| m.as_str()).trim();
            found.push((
                whole.start(),
                ParsedMessage {
                    role: *role,
                    content: content.to_string(),
                    timestamp,
                },
            ));
        }
    }

    if found.is_empty() {
        return vec![ParsedMessage {
            role: MessageRole::User,
            content: tail_chars(history.trim(), FALLBACK_MAX_CHARS).to_string(),
            timestamp,
        }];
    }

    found.sort_by_key(|(position, _)| *position);
    found.into_iter().map(|(_, message)| message).collect()
}

/// Current time as fractional unix seconds, the wire format the AI expects.
pub fn now_unix() -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let millis = chrono::Utc::now().timestamp_millis() as f64;
    millis / 1000.0
}

/// Last `max_chars` characters of `s`, respecting char boundaries.
fn tail_chars(s: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match s.char_indices().rev().nth(max_chars - 1) {
        Some((start, _)) => s.get(start..).unwrap_or(s),
        None => s,
    }
}

#[cfg(test)]
mod proptests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_no_previous_history() {
        assert_eq!(diff("<USER>hi</USER><br>", ""), "<USER>hi</USER><br>");
    }

    #[test]
    fn test_diff_extracts_suffix() {
        let old = "<USER>hi</USER><br>";
        let new = "<USER>hi</USER><br><BOT>hello</BOT><br>";
        assert_eq!(diff(new, old), "<BOT>hello</BOT><br>");
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let h = "<USER>hi</USER><br>";
        assert_eq!(diff(h, h), "");
    }

    #[test]
    fn test_diff_rewritten_history_returned_whole() {
        // Processed prefix no longer present: everything is new
        let new = "<USER>different</USER><br>";
        assert_eq!(diff(new, "<USER>hi</USER><br>"), new);
    }

    #[test]
    fn test_parse_orders_by_position() {
        let messages =
            parse("<USER>hi</USER><br><BOT>hello</BOT><br><USER>how are you</USER><br>");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].role, MessageRole::Bot);
        assert_eq!(messages[1].content, "hello");
        assert_eq!(messages[2].role, MessageRole::User);
        assert_eq!(messages[2].content, "how are you");
    }

    #[test]
    fn test_parse_sale_tag() {
        let messages = parse("<SALE>discount offer</SALE><br><USER>yes</USER><br>");
        assert_eq!(messages[0].role, MessageRole::Sale);
        assert_eq!(messages[1].role, MessageRole::User);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse("").is_empty());
        assert!(parse("   \n ").is_empty());
    }

    #[test]
    fn test_parse_ignores_unmatched_text() {
        let messages = parse("junk<USER>hi</USER><br>trailing junk");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hi");
    }

    #[test]
    fn test_parse_unstructured_falls_back_to_user_message() {
        let messages = parse("just plain text from somewhere");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "just plain text from somewhere");
    }

    #[test]
    fn test_parse_unstructured_truncates_to_tail() {
        let long = "x".repeat(12_000);
        let messages = parse(&long);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.chars().count(), 10_000);
    }

    #[test]
    fn test_tail_chars_multibyte_boundary() {
        let s = "ề".repeat(20);
        assert_eq!(tail_chars(&s, 5).chars().count(), 5);
    }

    #[test]
    fn test_parse_multiline_content() {
        let messages = parse("<USER>line one\nline two</USER><br>");
        assert_eq!(messages[0].content, "line one\nline two");
    }
}
