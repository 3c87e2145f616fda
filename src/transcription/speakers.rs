//! Speaker attribution log.
//!
//! Append-only: the automation layer reports every active-speaker change,
//! and the current speaker at any instant is the last change at or before it.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct Speaker {
    pub name: String,
    pub active_from: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SpeakerLog {
    entries: Vec<Speaker>,
}

impl SpeakerLog {
    pub fn push(&mut self, name: String) {
        self.push_at(name, Utc::now());
    }

    pub fn push_at(&mut self, name: String, at: DateTime<Utc>) {
        self.entries.push(Speaker {
            name,
            active_from: at,
        });
    }

    /// The speaker active at `at`: the last entry not after it.
    pub fn speaker_at(&self, at: DateTime<Utc>) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|s| s.active_from <= at)
            .map(|s| s.name.as_str())
    }

    pub fn current(&self) -> Option<&str> {
        self.entries.last().map(|s| s.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_last_speaker_before_now() {
        let mut log = SpeakerLog::default();
        log.push_at("Ada".to_string(), at(0));
        log.push_at("Grace".to_string(), at(10));
        log.push_at("Ada".to_string(), at(20));

        assert_eq!(log.speaker_at(at(5)), Some("Ada"));
        assert_eq!(log.speaker_at(at(10)), Some("Grace"));
        assert_eq!(log.speaker_at(at(15)), Some("Grace"));
        assert_eq!(log.speaker_at(at(25)), Some("Ada"));
        assert_eq!(log.current(), Some("Ada"));
    }

    #[test]
    fn test_no_speaker_before_first_entry() {
        let mut log = SpeakerLog::default();
        assert_eq!(log.speaker_at(at(0)), None);
        log.push_at("Ada".to_string(), at(10));
        assert_eq!(log.speaker_at(at(5)), None);
    }
}
