//! Meeting invite: the immutable description of the call this process joins.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported meeting platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeetingPlatform {
    Zoom,
    Teams,
    Webex,
    Chime,
}

impl MeetingPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zoom => "zoom",
            Self::Teams => "teams",
            Self::Webex => "webex",
            Self::Chime => "chime",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "zoom" => Ok(Self::Zoom),
            "teams" | "msteams" => Ok(Self::Teams),
            "webex" => Ok(Self::Webex),
            "chime" => Ok(Self::Chime),
            other => bail!(
                "Unknown meeting platform '{}'. Supported platforms: zoom, teams, webex, chime",
                other
            ),
        }
    }
}

/// Everything needed to join one meeting. Supplied at process start and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct MeetingInvite {
    pub platform: MeetingPlatform,
    pub meeting_id: String,
    pub meeting_password: Option<String>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub caller_name: String,
    pub participant_id: String,
}

impl MeetingInvite {
    /// Build an invite from the process environment.
    pub fn from_env() -> Result<Self> {
        let platform_raw =
            std::env::var("MEETING_PLATFORM").context("MEETING_PLATFORM is required")?;
        let meeting_id = std::env::var("MEETING_ID").context("MEETING_ID is required")?;
        let meeting_password = std::env::var("MEETING_PASSWORD").ok().filter(|p| !p.is_empty());

        let scheduled_start = match std::env::var("MEETING_TIME").ok().filter(|t| !t.is_empty()) {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("MEETING_TIME '{}' is not RFC3339", raw))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let caller_name =
            std::env::var("CALLER_NAME").unwrap_or_else(|_| "Virtual Participant".to_string());
        let participant_id = std::env::var("PARTICIPANT_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            platform: MeetingPlatform::parse(&platform_raw)?,
            meeting_id,
            meeting_password,
            scheduled_start,
            caller_name,
            participant_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        assert_eq!(MeetingPlatform::parse("zoom").unwrap(), MeetingPlatform::Zoom);
        assert_eq!(MeetingPlatform::parse("Teams").unwrap(), MeetingPlatform::Teams);
        assert_eq!(MeetingPlatform::parse("msteams").unwrap(), MeetingPlatform::Teams);
        assert_eq!(MeetingPlatform::parse("WEBEX").unwrap(), MeetingPlatform::Webex);
        assert_eq!(MeetingPlatform::parse("chime").unwrap(), MeetingPlatform::Chime);
        assert!(MeetingPlatform::parse("meet").is_err());
    }

    #[test]
    fn test_platform_as_str_round_trip() {
        for platform in [
            MeetingPlatform::Zoom,
            MeetingPlatform::Teams,
            MeetingPlatform::Webex,
            MeetingPlatform::Chime,
        ] {
            assert_eq!(MeetingPlatform::parse(platform.as_str()).unwrap(), platform);
        }
    }
}
