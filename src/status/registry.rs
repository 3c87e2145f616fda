//! Execution metadata, target-group registration and the task registry entry.
//!
//! All of this is auxiliary plumbing around the status record: querying the
//! local metadata endpoint for task identity, registering the instance IP
//! with the load-balancer target group so the remote-view endpoint routes,
//! and writing a TTL registry record an external controller can use to
//! terminate the task directly.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::signing::{self, SigningCredentials};

/// Identity of the running compute task, from the local metadata endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskIdentity {
    #[serde(rename = "TaskARN")]
    pub task_arn: String,
    #[serde(rename = "Cluster")]
    pub cluster: String,
    #[serde(default, rename = "PrivateIp")]
    pub private_ip: Option<String>,
}

/// TTL record mapping the participant to its compute task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRegistryEntry {
    pub participant_id: String,
    pub task_arn: String,
    pub cluster: String,
    pub created_at: String,
    pub status: String,
    /// Unix epoch seconds after which the record expires.
    pub expires_at: i64,
}

impl TaskRegistryEntry {
    pub fn new(participant_id: &str, identity: &TaskIdentity, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            participant_id: participant_id.to_string(),
            task_arn: identity.task_arn.clone(),
            cluster: identity.cluster.clone(),
            created_at: now.to_rfc3339(),
            status: "RUNNING".to_string(),
            expires_at: now.timestamp() + ttl_secs,
        }
    }
}

pub struct InstanceRegistry {
    client: reqwest::Client,
    credentials: Option<SigningCredentials>,
    metadata_endpoint: Option<String>,
    target_group_arn: Option<String>,
    region: String,
    graphql_endpoint: String,
}

impl InstanceRegistry {
    pub fn new(config: &Config) -> Self {
        let credentials = match (&config.signing_access_key, &config.signing_secret_key) {
            (Some(access_key), Some(secret_key)) => Some(SigningCredentials {
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
                region: config.region.clone(),
                service: "elasticloadbalancing".to_string(),
            }),
            _ => None,
        };

        Self {
            client: reqwest::Client::new(),
            credentials,
            metadata_endpoint: config.metadata_endpoint.clone(),
            target_group_arn: config.target_group_arn.clone(),
            region: config.region.clone(),
            graphql_endpoint: config.graphql_endpoint.clone(),
        }
    }

    /// Query the local metadata endpoint for this task's identity.
    /// Non-fatal: callers log and continue without it.
    pub async fn task_identity(&self) -> Result<TaskIdentity> {
        let endpoint = self
            .metadata_endpoint
            .as_ref()
            .context("No metadata endpoint configured")?;
        let url = format!("{}/task", endpoint.trim_end_matches('/'));
        let identity = self
            .client
            .get(&url)
            .send()
            .await
            .context("Metadata endpoint unreachable")?
            .json::<TaskIdentity>()
            .await
            .context("Failed to parse task metadata")?;
        info!("Task identity: {} on {}", identity.task_arn, identity.cluster);
        Ok(identity)
    }

    /// Register this instance's IP with the target group. The orchestrator
    /// treats a registration failure as fatal: without it the remote-view
    /// endpoint never routes here.
    pub async fn register_target(&self, private_ip: &str, port: u16) -> Result<()> {
        let target_group = self
            .target_group_arn
            .as_ref()
            .context("No target group configured")?;
        self.target_call("RegisterTargets", target_group, private_ip, port)
            .await
            .context("Target group registration failed")?;
        info!("Registered {}:{} with target group", private_ip, port);
        Ok(())
    }

    /// Deregistration happens during teardown; failures are logged only.
    pub async fn deregister_target(&self, private_ip: &str, port: u16) {
        let Some(target_group) = self.target_group_arn.as_ref() else {
            return;
        };
        match self
            .target_call("DeregisterTargets", target_group, private_ip, port)
            .await
        {
            Ok(()) => info!("Deregistered {}:{} from target group", private_ip, port),
            Err(e) => warn!("Target deregistration failed: {:#}", e),
        }
    }

    async fn target_call(
        &self,
        action: &str,
        target_group: &str,
        private_ip: &str,
        port: u16,
    ) -> Result<()> {
        let credentials = self
            .credentials
            .as_ref()
            .context("No signing credentials configured")?;
        let host = format!("elasticloadbalancing.{}.amazonaws.com", self.region);
        let endpoint = format!("https://{}/", host);
        let body = json!({
            "Action": action,
            "TargetGroupArn": target_group,
            "Targets": [{ "Id": private_ip, "Port": port }],
        })
        .to_string();

        let headers = signing::sign_request(credentials, &host, "/", &body)?;
        let mut request = self.client.post(&endpoint);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("{} returned {}: {}", action, status, text);
        }
        Ok(())
    }

    /// Record the participant → task mapping so the controller can terminate
    /// the task without discovery. Best effort.
    pub async fn publish_registry_entry(&self, entry: &TaskRegistryEntry) {
        let mutation = "mutation PutTaskRegistryEntry($input: TaskRegistryInput!) \
            { putTaskRegistryEntry(input: $input) { participantId } }";
        let body = json!({ "query": mutation, "variables": { "input": entry } }).to_string();

        let result: Result<()> = async {
            let mut request = self.client.post(&self.graphql_endpoint);
            if let Some(credentials) = &self.credentials {
                let graphql_credentials = SigningCredentials {
                    service: "appsync".to_string(),
                    ..credentials.clone()
                };
                let host = signing::host_of(&self.graphql_endpoint)?;
                let headers = signing::sign_request(&graphql_credentials, &host, "/graphql", &body)?;
                for (name, value) in &headers {
                    request = request.header(name.as_str(), value.as_str());
                }
            } else {
                request = request.header("content-type", "application/json");
            }
            let response = request.body(body).send().await?;
            anyhow::ensure!(
                response.status().is_success(),
                "Registry mutation returned {}",
                response.status()
            );
            Ok(())
        }
        .await;

        match result {
            Ok(()) => info!("Task registry entry published"),
            Err(e) => warn!("Failed to publish task registry entry: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_entry_expiry() {
        let identity = TaskIdentity {
            task_arn: "arn:aws:ecs:us-east-1:1234:task/cluster/abc".to_string(),
            cluster: "meetings".to_string(),
            private_ip: Some("10.0.1.5".to_string()),
        };
        let entry = TaskRegistryEntry::new("vp-1", &identity, 86_400);

        assert_eq!(entry.participant_id, "vp-1");
        assert_eq!(entry.status, "RUNNING");
        let now = Utc::now().timestamp();
        assert!(entry.expires_at > now + 86_000);
        assert!(entry.expires_at <= now + 86_400 + 5);
    }
}
