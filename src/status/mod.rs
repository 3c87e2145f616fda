//! Participant lifecycle state, published to the external backend.
//!
//! Transitions are linear with a terminal fork:
//! initializing → connecting → joining → joined → active → completed | failed.
//! Every mutation follows read-preserve-write: the current record is fetched
//! first and fields the transition does not touch are copied forward.

pub mod registry;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::signing::{self, SigningCredentials};

/// Lifecycle status of the virtual participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Initializing,
    Connecting,
    Joining,
    Joined,
    Active,
    Completed,
    Failed,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Connecting => "CONNECTING",
            Self::Joining => "JOINING",
            Self::Joined => "JOINED",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Kind of human intervention a manual-action signal requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualActionKind {
    Login,
    Captcha,
}

/// The remote virtual-participant record, as returned by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualParticipant {
    pub id: String,
    pub status: Option<String>,
    pub call_id: Option<String>,
    pub vnc_endpoint: Option<String>,
    pub vnc_port: Option<u16>,
    pub vnc_ready: Option<bool>,
    pub manual_action: Option<String>,
}

/// Update payload sent to the backend. Built from the fetched record so that
/// untouched fields survive the write.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdate {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_action: Option<String>,
}

/// Fields a transition explicitly sets; everything else is preserved.
#[derive(Debug, Clone, Default)]
pub struct UpdateOverrides {
    pub vnc_endpoint: Option<String>,
    pub vnc_port: Option<u16>,
    pub vnc_ready: Option<bool>,
    /// `Some(None)` clears the manual-action flag; `Some(Some(_))` raises it.
    pub manual_action: Option<Option<String>>,
}

/// Build the update for a status transition, carrying forward every field the
/// caller did not explicitly override.
pub fn build_update(
    current: &VirtualParticipant,
    status: ParticipantStatus,
    overrides: &UpdateOverrides,
) -> ParticipantUpdate {
    ParticipantUpdate {
        id: current.id.clone(),
        status: status.as_str().to_string(),
        call_id: current.call_id.clone(),
        vnc_endpoint: overrides
            .vnc_endpoint
            .clone()
            .or_else(|| current.vnc_endpoint.clone()),
        vnc_port: overrides.vnc_port.or(current.vnc_port),
        vnc_ready: overrides.vnc_ready.or(current.vnc_ready),
        manual_action: match &overrides.manual_action {
            Some(value) => value.clone(),
            None => current.manual_action.clone(),
        },
    }
}

const GET_QUERY: &str = "query GetVirtualParticipant($id: ID!) { getVirtualParticipant(id: $id) \
    { id status callId vncEndpoint vncPort vncReady manualAction } }";
const UPDATE_MUTATION: &str = "mutation UpdateVirtualParticipant($input: UpdateVirtualParticipantInput!) \
    { updateVirtualParticipant(input: $input) { id status } }";

pub struct StatusManager {
    client: reqwest::Client,
    endpoint: String,
    credentials: Option<SigningCredentials>,
    participant_id: String,
    current: tokio::sync::Mutex<ParticipantStatus>,
}

impl StatusManager {
    pub fn new(config: &Config, participant_id: String) -> Self {
        let credentials = match (&config.signing_access_key, &config.signing_secret_key) {
            (Some(access_key), Some(secret_key)) => Some(SigningCredentials {
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
                region: config.region.clone(),
                service: "appsync".to_string(),
            }),
            _ => None,
        };

        Self {
            client: reqwest::Client::new(),
            endpoint: config.graphql_endpoint.clone(),
            credentials,
            participant_id,
            current: tokio::sync::Mutex::new(ParticipantStatus::Initializing),
        }
    }

    pub async fn current(&self) -> ParticipantStatus {
        *self.current.lock().await
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value> {
        let body = json!({ "query": query, "variables": variables }).to_string();

        let mut request = self.client.post(&self.endpoint);
        if let Some(credentials) = &self.credentials {
            let host = signing::host_of(&self.endpoint)?;
            let headers = signing::sign_request(credentials, &host, "/graphql", &body)?;
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }
        } else {
            request = request.header("content-type", "application/json");
        }

        let response = request
            .body(body)
            .send()
            .await
            .context("GraphQL request failed")?;
        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .context("GraphQL response was not JSON")?;

        if !status.is_success() {
            anyhow::bail!("GraphQL request failed with status {}: {}", status, payload);
        }
        if let Some(errors) = payload.get("errors").filter(|e| !e.is_null()) {
            anyhow::bail!("GraphQL errors: {}", errors);
        }
        Ok(payload)
    }

    /// Fetch the current remote record.
    pub async fn fetch(&self) -> Result<VirtualParticipant> {
        let payload = self
            .graphql(GET_QUERY, json!({ "id": self.participant_id }))
            .await?;
        let record = payload
            .pointer("/data/getVirtualParticipant")
            .cloned()
            .context("Participant record missing from response")?;
        serde_json::from_value(record).context("Failed to parse participant record")
    }

    async fn transition(
        &self,
        status: ParticipantStatus,
        overrides: UpdateOverrides,
    ) -> Result<()> {
        let current = self.fetch().await?;
        let update = build_update(&current, status, &overrides);
        self.graphql(UPDATE_MUTATION, json!({ "input": update }))
            .await?;
        *self.current.lock().await = status;
        info!("Participant status -> {}", status.as_str());
        Ok(())
    }

    /// Non-escalating transition: failures are logged, not returned, since
    /// most transitions must not abort the run.
    async fn transition_logged(&self, status: ParticipantStatus, overrides: UpdateOverrides) {
        if let Err(e) = self.transition(status, overrides).await {
            warn!("Failed to publish status {}: {:#}", status.as_str(), e);
        }
    }

    pub async fn set_connecting(&self) {
        self.transition_logged(ParticipantStatus::Connecting, UpdateOverrides::default())
            .await;
    }

    pub async fn set_joining(&self) {
        self.transition_logged(ParticipantStatus::Joining, UpdateOverrides::default())
            .await;
    }

    /// The one transition whose failure is escalated: downstream logic depends
    /// on the backend having recorded the join.
    pub async fn set_joined(&self) -> Result<()> {
        self.transition(ParticipantStatus::Joined, UpdateOverrides::default())
            .await
            .context("Failed to record JOINED status")
    }

    pub async fn set_active(&self) {
        self.transition_logged(ParticipantStatus::Active, UpdateOverrides::default())
            .await;
    }

    pub async fn set_completed(&self) {
        self.transition_logged(ParticipantStatus::Completed, UpdateOverrides::default())
            .await;
    }

    /// Terminal failure with an optional categorized reason. Reported, not
    /// thrown: the caller is already unwinding.
    pub async fn set_failed(&self, reason: Option<&str>) {
        if let Some(reason) = reason {
            error!("Participant failed: {}", reason);
        }
        self.transition_logged(ParticipantStatus::Failed, UpdateOverrides::default())
            .await;
    }

    /// Publish the remote-view endpoint once the local VNC server is up.
    pub async fn publish_vnc_endpoint(&self, endpoint: String, port: u16) {
        let status = self.current().await;
        self.transition_logged(
            status,
            UpdateOverrides {
                vnc_endpoint: Some(endpoint),
                vnc_port: Some(port),
                vnc_ready: Some(true),
                manual_action: None,
            },
        )
        .await;
    }

    /// Raise the manual-action flag without moving the linear state machine.
    pub async fn manual_action_required(
        &self,
        kind: ManualActionKind,
        instruction: &str,
        timeout_secs: u64,
    ) {
        let payload = json!({
            "kind": kind,
            "instruction": instruction,
            "timeoutSeconds": timeout_secs,
        })
        .to_string();
        let status = self.current().await;
        info!("Manual action required ({:?}): {}", kind, instruction);
        self.transition_logged(
            status,
            UpdateOverrides {
                manual_action: Some(Some(payload)),
                ..Default::default()
            },
        )
        .await;
    }

    pub async fn clear_manual_action(&self) {
        let status = self.current().await;
        self.transition_logged(
            status,
            UpdateOverrides {
                manual_action: Some(None),
                ..Default::default()
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> VirtualParticipant {
        VirtualParticipant {
            id: "vp-1".to_string(),
            status: Some("JOINING".to_string()),
            call_id: Some("call-42".to_string()),
            vnc_endpoint: Some("wss://view.example.com/vp-1".to_string()),
            vnc_port: Some(6080),
            vnc_ready: Some(true),
            manual_action: None,
        }
    }

    #[test]
    fn test_update_preserves_untouched_fields() {
        let update = build_update(&record(), ParticipantStatus::Joined, &UpdateOverrides::default());

        assert_eq!(update.status, "JOINED");
        assert_eq!(update.call_id.as_deref(), Some("call-42"));
        assert_eq!(update.vnc_endpoint.as_deref(), Some("wss://view.example.com/vp-1"));
        assert_eq!(update.vnc_port, Some(6080));
        assert_eq!(update.vnc_ready, Some(true));
    }

    #[test]
    fn test_update_applies_explicit_overrides() {
        let overrides = UpdateOverrides {
            vnc_endpoint: Some("wss://view.example.com/new".to_string()),
            vnc_port: Some(5901),
            vnc_ready: Some(false),
            manual_action: None,
        };
        let update = build_update(&record(), ParticipantStatus::Active, &overrides);

        assert_eq!(update.vnc_endpoint.as_deref(), Some("wss://view.example.com/new"));
        assert_eq!(update.vnc_port, Some(5901));
        assert_eq!(update.vnc_ready, Some(false));
        // Call association still carried forward.
        assert_eq!(update.call_id.as_deref(), Some("call-42"));
    }

    #[test]
    fn test_manual_action_set_and_clear() {
        let mut current = record();
        current.manual_action = Some("{\"kind\":\"CAPTCHA\"}".to_string());

        // No override: flag preserved.
        let kept = build_update(&current, ParticipantStatus::Joining, &UpdateOverrides::default());
        assert!(kept.manual_action.is_some());

        // Explicit clear.
        let cleared = build_update(
            &current,
            ParticipantStatus::Joining,
            &UpdateOverrides {
                manual_action: Some(None),
                ..Default::default()
            },
        );
        assert!(cleared.manual_action.is_none());
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(ParticipantStatus::Initializing.as_str(), "INITIALIZING");
        assert_eq!(ParticipantStatus::Completed.as_str(), "COMPLETED");
        assert_eq!(ParticipantStatus::Failed.as_str(), "FAILED");
    }
}
