//! Environment-driven configuration.
//!
//! Every deployment knob comes from the environment (the task definition in
//! production, a `.env` file locally). `ExecutionMode` is the single policy
//! switch for fatal-vs-log behavior on stream and subprocess errors.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;

/// How strictly transport errors are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Unrecoverable stream errors terminate the process so the external
    /// supervisor restarts it with a clean state machine.
    Production,
    /// Transport errors are logged and absorbed for interactive debugging.
    LocalTest,
}

impl ExecutionMode {
    pub fn from_env() -> Self {
        match std::env::var("EXECUTION_MODE").as_deref() {
            Ok("local") | Ok("local-test") | Ok("localtest") => Self::LocalTest,
            _ => Self::Production,
        }
    }

    /// Whether an unrecoverable stream error should take the process down.
    pub fn stream_errors_fatal(&self) -> bool {
        matches!(self, Self::Production)
    }

    /// Whether auxiliary transport errors should be absorbed.
    pub fn absorbs_transport_errors(&self) -> bool {
        matches!(self, Self::LocalTest)
    }
}

/// Which voice assistant provider to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentProvider {
    None,
    ElevenLabs,
    Nova,
}

/// When the voice agent listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    /// Session opens at start and stays open.
    AlwaysActive,
    /// Session opens on wake-phrase activation, closes on deactivation.
    WakePhrase,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub provider: AgentProvider,
    pub activation_mode: ActivationMode,
    /// Listening window armed by each activation.
    pub activation_window: Duration,
    pub elevenlabs_agent_id: Option<String>,
    pub elevenlabs_api_key: Option<String>,
    pub nova_endpoint: Option<String>,
    pub nova_model_id: String,
    /// Playback sample rate for agent audio, Hz.
    pub output_sample_rate: u32,
    /// HTTP endpoint of the external reasoning function for delegated tool calls.
    pub delegate_endpoint: Option<String>,
}

/// Chat phrases the participant obeys from inside the meeting.
#[derive(Debug, Clone)]
pub struct ChatCommands {
    pub end: String,
    pub pause: String,
    pub resume: String,
}

impl Default for ChatCommands {
    fn default() -> Self {
        Self {
            end: "leave meeting".to_string(),
            pause: "pause recording".to_string(),
            resume: "resume recording".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub execution_mode: ExecutionMode,
    pub region: String,
    /// GraphQL backend endpoint for the virtual-participant record.
    pub graphql_endpoint: String,
    /// Events pub/sub endpoint (`wss://...`).
    pub events_endpoint: Option<String>,
    /// Ingest stream endpoint for transcript/meeting events.
    pub ingest_endpoint: Option<String>,
    /// Streaming recognition endpoint (`wss://...`).
    pub recognition_endpoint: String,
    pub recognition_api_key: Option<String>,
    pub recognition_language: String,
    /// Capture sample rate, Hz. 16-bit mono PCM.
    pub sample_rate: u32,
    /// Local execution metadata endpoint (task identity, addresses).
    pub metadata_endpoint: Option<String>,
    /// Load-balancer target group to register the instance with.
    pub target_group_arn: Option<String>,
    pub signing_access_key: Option<String>,
    pub signing_secret_key: Option<String>,
    /// Command line for the local tool-execution (MCP) server, empty to disable.
    pub mcp_server_command: Option<String>,
    pub agent: AgentConfig,
    pub chat_commands: ChatCommands,
    /// Remote-view (VNC websocket) port published through the status record.
    pub vnc_port: u16,
    /// WebDriver endpoint for the automation browser.
    pub webdriver_url: String,
    /// Fallback bound on total meeting duration.
    pub max_meeting_duration: Duration,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        // Missing .env is fine in production; the task definition sets everything.
        let _ = dotenvy::dotenv();

        let execution_mode = ExecutionMode::from_env();
        let graphql_endpoint =
            std::env::var("GRAPHQL_ENDPOINT").context("GRAPHQL_ENDPOINT is required")?;
        let recognition_endpoint = env_opt("RECOGNITION_ENDPOINT")
            .unwrap_or_else(|| "wss://api.assemblyai.com/v2/realtime/ws".to_string());

        let provider = match env_opt("VOICE_AGENT_PROVIDER").as_deref() {
            Some("elevenlabs") => AgentProvider::ElevenLabs,
            Some("nova") => AgentProvider::Nova,
            Some("none") | None => AgentProvider::None,
            Some(other) => {
                anyhow::bail!(
                    "Unknown voice agent provider '{}'. Supported providers: elevenlabs, nova, none",
                    other
                )
            }
        };

        let activation_mode = match env_opt("AGENT_ACTIVATION_MODE").as_deref() {
            Some("always") | Some("always-active") => ActivationMode::AlwaysActive,
            _ => ActivationMode::WakePhrase,
        };

        let activation_secs = env_opt("AGENT_ACTIVATION_SECONDS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let max_meeting_hours = env_opt("MAX_MEETING_HOURS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(4);

        let config = Self {
            execution_mode,
            region: env_opt("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            graphql_endpoint,
            events_endpoint: env_opt("EVENTS_ENDPOINT"),
            ingest_endpoint: env_opt("INGEST_ENDPOINT"),
            recognition_endpoint,
            recognition_api_key: env_opt("RECOGNITION_API_KEY"),
            recognition_language: env_opt("RECOGNITION_LANGUAGE")
                .unwrap_or_else(|| "en".to_string()),
            sample_rate: env_opt("CAPTURE_SAMPLE_RATE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(16_000),
            metadata_endpoint: env_opt("ECS_CONTAINER_METADATA_URI_V4"),
            target_group_arn: env_opt("TARGET_GROUP_ARN"),
            signing_access_key: env_opt("SIGNING_ACCESS_KEY_ID"),
            signing_secret_key: env_opt("SIGNING_SECRET_ACCESS_KEY"),
            mcp_server_command: env_opt("MCP_SERVER_COMMAND"),
            agent: AgentConfig {
                provider,
                activation_mode,
                activation_window: Duration::from_secs(activation_secs),
                elevenlabs_agent_id: env_opt("ELEVENLABS_AGENT_ID"),
                elevenlabs_api_key: env_opt("ELEVENLABS_API_KEY"),
                nova_endpoint: env_opt("NOVA_ENDPOINT"),
                nova_model_id: env_opt("NOVA_MODEL_ID")
                    .unwrap_or_else(|| "amazon.nova-sonic-v1:0".to_string()),
                output_sample_rate: env_opt("AGENT_OUTPUT_SAMPLE_RATE")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(24_000),
                delegate_endpoint: env_opt("AGENT_DELEGATE_ENDPOINT"),
            },
            chat_commands: ChatCommands::default(),
            vnc_port: env_opt("VNC_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(6080),
            webdriver_url: env_opt("WEBDRIVER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:4444".to_string()),
            max_meeting_duration: Duration::from_secs(max_meeting_hours * 3600),
        };

        info!(
            "Loaded config: mode={:?}, agent={:?}, activation={:?}",
            config.execution_mode, config.agent.provider, config.agent.activation_mode
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_mode_policy() {
        assert!(ExecutionMode::Production.stream_errors_fatal());
        assert!(!ExecutionMode::Production.absorbs_transport_errors());
        assert!(!ExecutionMode::LocalTest.stream_errors_fatal());
        assert!(ExecutionMode::LocalTest.absorbs_transport_errors());
    }

    #[test]
    fn test_default_chat_commands() {
        let commands = ChatCommands::default();
        assert_eq!(commands.end, "leave meeting");
        assert_eq!(commands.pause, "pause recording");
        assert_eq!(commands.resume, "resume recording");
    }
}
