//! Wake-phrase detection over a rolling transcript buffer.
//!
//! Matching is case- and punctuation-insensitive: text is normalized by
//! mapping punctuation to spaces, collapsing whitespace and lower-casing,
//! then scanned for substring containment of an accepted phrasing. A run-on
//! like "heyalex" does not match because no separator survives.

use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Accepted phrasings of the activation phrase.
pub const WAKE_PHRASES: &[&str] = &["hey alex", "ok alex", "okay alex", "hi alex"];

/// Seconds of transcript kept for phrase scanning.
pub const BUFFER_WINDOW: Duration = Duration::from_secs(10);
/// How long to wait after a match for trailing words of the same utterance.
pub const SETTLE_DELAY: Duration = Duration::from_secs(3);
/// How far before the match the assembled context starts.
pub const CONTEXT_LEAD: Duration = Duration::from_secs(2);

fn punctuation() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("static regex"))
}

/// Normalize for matching: punctuation to spaces, collapsed whitespace,
/// lowercase.
pub fn normalize(text: &str) -> String {
    punctuation()
        .replace_all(text, " ")
        .trim()
        .to_lowercase()
}

/// Scan normalized text for an accepted phrasing.
pub fn find_wake_phrase(normalized: &str) -> Option<&'static str> {
    WAKE_PHRASES
        .iter()
        .copied()
        .find(|phrase| normalized.contains(phrase))
}

/// Remove everything up to and including the matched phrase; the remainder is
/// the initial context handed to the agent.
pub fn strip_phrase(normalized: &str, phrase: &str) -> String {
    match normalized.find(phrase) {
        Some(index) => normalized[index + phrase.len()..].trim().to_string(),
        None => normalized.to_string(),
    }
}

/// Rolling buffer of final transcript text, pruned to [`BUFFER_WINDOW`].
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    entries: VecDeque<(Instant, String)>,
}

impl TranscriptBuffer {
    pub fn push(&mut self, text: String) {
        self.push_at(Instant::now(), text);
    }

    pub fn push_at(&mut self, at: Instant, text: String) {
        self.entries.push_back((at, text));
        self.prune(at);
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.entries.front() {
            if now.duration_since(*at) > BUFFER_WINDOW {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Joined text of all entries at or after `from`.
    pub fn text_since(&self, from: Instant) -> String {
        self.entries
            .iter()
            .filter(|(at, _)| *at >= from)
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Joined text of the whole window.
    pub fn text(&self) -> String {
        self.entries
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Assemble the activation context: buffered text from shortly before the
/// match onward, normalized, with the matched phrase stripped.
pub fn activation_context(buffer: &TranscriptBuffer, matched_at: Instant, phrase: &str) -> String {
    let from = matched_at
        .checked_sub(CONTEXT_LEAD)
        .unwrap_or(matched_at);
    strip_phrase(&normalize(&buffer.text_since(from)), phrase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_folds_punctuation_and_case() {
        assert_eq!(normalize("Hey, Alex?"), "hey alex");
        assert_eq!(normalize("  OK   Alex!!  "), "ok alex");
        assert_eq!(normalize("what's next"), "what s next");
    }

    #[test]
    fn test_wake_phrase_case_and_punctuation_insensitive() {
        assert_eq!(find_wake_phrase(&normalize("Hey, Alex?")), Some("hey alex"));
        assert_eq!(find_wake_phrase(&normalize("hey alex")), Some("hey alex"));
        assert_eq!(find_wake_phrase(&normalize("well OKAY alex then")), Some("okay alex"));
    }

    #[test]
    fn test_no_match_without_separator() {
        assert_eq!(find_wake_phrase(&normalize("heyalex")), None);
        assert_eq!(find_wake_phrase(&normalize("sayheyalexnow")), None);
    }

    #[test]
    fn test_strip_phrase() {
        assert_eq!(
            strip_phrase("ok alex what s on the agenda", "ok alex"),
            "what s on the agenda"
        );
        assert_eq!(strip_phrase("no phrase here", "ok alex"), "no phrase here");
    }

    #[test]
    fn test_buffer_prunes_old_entries() {
        let mut buffer = TranscriptBuffer::default();
        let start = Instant::now();
        buffer.push_at(start, "old words".to_string());
        buffer.push_at(start + Duration::from_secs(11), "new words".to_string());
        assert_eq!(buffer.text(), "new words");
    }

    #[test]
    fn test_trailing_words_join_context() {
        // "OK Alex, what's on the agenda" then "for tomorrow" one second later.
        let mut buffer = TranscriptBuffer::default();
        let t0 = Instant::now();
        buffer.push_at(t0, "OK Alex, what's on the agenda".to_string());
        buffer.push_at(t0 + Duration::from_secs(1), "for tomorrow".to_string());

        let context = activation_context(&buffer, t0, "ok alex");
        assert!(
            context.ends_with("agenda for tomorrow"),
            "context was '{}'",
            context
        );
        assert!(!context.contains("ok alex"));
    }

    #[test]
    fn test_context_excludes_text_before_lead() {
        let mut buffer = TranscriptBuffer::default();
        let t0 = Instant::now();
        buffer.push_at(t0, "unrelated earlier chatter".to_string());
        let matched_at = t0 + Duration::from_secs(5);
        buffer.push_at(matched_at, "hey alex summarize this".to_string());

        let context = activation_context(&buffer, matched_at, "hey alex");
        assert_eq!(context, "summarize this");
    }
}
