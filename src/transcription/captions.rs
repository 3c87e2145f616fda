//! Caption lines built from final recognition results.
//!
//! Lines are keyed by contiguous same-speaker runs and formatted as
//! `[HH:MM] Speaker: words`. Punctuation tokens attach to the preceding
//! word without an inserted space.

use chrono::{DateTime, Local, Utc};

use super::{WordItem, WordKind};

#[derive(Debug, Default)]
pub struct CaptionBuilder {
    lines: Vec<String>,
    last_speaker: Option<String>,
}

impl CaptionBuilder {
    /// Append a final segment attributed to `speaker`.
    pub fn append(&mut self, speaker: &str, at: DateTime<Utc>, words: &[WordItem]) {
        let rendered = render_words(words);
        if rendered.is_empty() {
            return;
        }

        if self.last_speaker.as_deref() == Some(speaker) {
            if let Some(line) = self.lines.last_mut() {
                line.push(' ');
                line.push_str(&rendered);
                return;
            }
        }

        let stamp = at.with_timezone(&Local).format("%H:%M");
        self.lines.push(format!("[{}] {}: {}", stamp, speaker, rendered));
        self.last_speaker = Some(speaker.to_string());
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn latest(&self) -> Option<&str> {
        self.lines.last().map(String::as_str)
    }
}

fn render_words(words: &[WordItem]) -> String {
    let mut out = String::new();
    for item in words {
        match item.kind {
            WordKind::Punctuation => out.push_str(&item.content),
            WordKind::Word => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&item.content);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(content: &str) -> WordItem {
        WordItem {
            content: content.to_string(),
            kind: WordKind::Word,
        }
    }

    fn punct(content: &str) -> WordItem {
        WordItem {
            content: content.to_string(),
            kind: WordKind::Punctuation,
        }
    }

    #[test]
    fn test_punctuation_attaches_without_space() {
        let items = [word("hello"), punct(","), word("world"), punct(".")];
        assert_eq!(render_words(&items), "hello, world.");
    }

    #[test]
    fn test_same_speaker_runs_extend_one_line() {
        let mut builder = CaptionBuilder::default();
        let at = Utc::now();
        builder.append("Ada", at, &[word("hello")]);
        builder.append("Ada", at, &[word("again")]);
        builder.append("Grace", at, &[word("hi")]);
        builder.append("Ada", at, &[word("back")]);

        assert_eq!(builder.lines().len(), 3);
        assert!(builder.lines()[0].ends_with("Ada: hello again"));
        assert!(builder.lines()[1].ends_with("Grace: hi"));
        assert!(builder.lines()[2].ends_with("Ada: back"));
    }

    #[test]
    fn test_empty_segment_is_skipped() {
        let mut builder = CaptionBuilder::default();
        builder.append("Ada", Utc::now(), &[]);
        assert!(builder.lines().is_empty());
        assert!(builder.latest().is_none());
    }

    #[test]
    fn test_line_has_clock_prefix() {
        let mut builder = CaptionBuilder::default();
        builder.append("Ada", Utc::now(), &[word("hello")]);
        let line = builder.latest().unwrap();
        // [HH:MM] prefix
        assert_eq!(&line[0..1], "[");
        assert_eq!(&line[6..8], "] ");
    }
}
