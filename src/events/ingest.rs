//! Ordered event-stream publisher.
//!
//! Discrete meeting events go to an external ordered stream for downstream
//! enrichment. Publication is best effort: the meeting must never stall on
//! the ingest path.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::signing::{self, SigningCredentials};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MeetingEvent {
    MeetingStart {
        call_id: String,
        platform: String,
        participant_id: String,
    },
    TranscriptSegment {
        call_id: String,
        /// Raw per-result recognition payload, republished as-is.
        payload: Value,
        speaker: Option<String>,
    },
    MeetingEnd {
        call_id: String,
        /// Formatted caption lines accumulated over the meeting.
        transcript: Vec<String>,
    },
    RecordingAvailable {
        call_id: String,
        url: String,
    },
}

#[derive(Clone)]
pub struct IngestPublisher {
    client: reqwest::Client,
    endpoint: Option<String>,
    credentials: Option<SigningCredentials>,
}

impl IngestPublisher {
    pub fn new(config: &Config) -> Self {
        let credentials = match (&config.signing_access_key, &config.signing_secret_key) {
            (Some(access_key), Some(secret_key)) => Some(SigningCredentials {
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
                region: config.region.clone(),
                service: "kinesis".to_string(),
            }),
            _ => None,
        };
        Self {
            client: reqwest::Client::new(),
            endpoint: config.ingest_endpoint.clone(),
            credentials,
        }
    }

    /// Publish one event; failures are logged and swallowed.
    pub async fn publish(&self, event: MeetingEvent) {
        let Some(endpoint) = self.endpoint.clone() else {
            debug!("Ingest disabled, dropping event");
            return;
        };
        if let Err(e) = self.send(&endpoint, &event).await {
            warn!("Failed to publish ingest event: {:#}", e);
        }
    }

    async fn send(&self, endpoint: &str, event: &MeetingEvent) -> Result<()> {
        let body = serde_json::to_string(event).context("Failed to serialize event")?;

        let mut request = self.client.post(endpoint);
        if let Some(credentials) = &self.credentials {
            let host = signing::host_of(endpoint)?;
            let headers = signing::sign_request(credentials, &host, "/records", &body)?;
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }
        } else {
            request = request.header("content-type", "application/json");
        }

        let response = request.body(body).send().await.context("Ingest request failed")?;
        anyhow::ensure!(
            response.status().is_success(),
            "Ingest endpoint returned {}",
            response.status()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tagging() {
        let event = MeetingEvent::TranscriptSegment {
            call_id: "call-1".to_string(),
            payload: json!({ "text": "hello", "partial": false }),
            speaker: Some("Ada".to_string()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "transcript-segment");
        assert_eq!(value["speaker"], "Ada");
        assert_eq!(value["payload"]["text"], "hello");

        let end = serde_json::to_value(MeetingEvent::MeetingEnd {
            call_id: "call-1".to_string(),
            transcript: vec!["[10:00] Ada: hello".to_string()],
        })
        .unwrap();
        assert_eq!(end["type"], "meeting-end");
        assert_eq!(end["transcript"][0], "[10:00] Ada: hello");
    }
}
