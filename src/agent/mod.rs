//! Voice assistant providers.
//!
//! A narrow uniform interface over three variants selected by configuration:
//! an inert no-op, a hosted conversational-agent WebSocket (ElevenLabs), and
//! a bidirectional foundation-model stream (Nova). Shared here: the
//! activation window with deferred deactivation, and the delegate tool that
//! hands questions to an external reasoning function.

pub mod elevenlabs;
pub mod noop;
pub mod nova;
pub mod playback;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{AgentConfig, AgentProvider};

/// Re-check interval while deactivation is deferred.
pub const DEFER_POLL: Duration = Duration::from_secs(1);

/// Uniform voice-assistant operations.
#[async_trait]
pub trait VoiceAssistant: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Forward one chunk of microphone PCM. Withheld internally while the
    /// agent is speaking, to avoid feedback.
    async fn send_audio_chunk(&self, pcm: &[u8]) -> Result<()>;
    async fn send_user_message(&self, text: &str) -> Result<()>;
    /// Open a listening window; `context` seeds the conversation.
    async fn activate(&self, window: Option<Duration>, context: Option<String>) -> Result<()>;
    async fn deactivate(&self) -> Result<()>;

    fn is_enabled(&self) -> bool;
    /// Whether a provider session is currently open.
    fn is_active(&self) -> bool;
    /// Whether the listening window is open.
    fn is_activated(&self) -> bool;
    fn is_speaking(&self) -> bool;
}

/// Shared activation bookkeeping for the live providers.
#[derive(Debug, Default)]
pub struct ActivationState {
    activated: AtomicBool,
    speaking: AtomicBool,
    tool_pending: AtomicBool,
    generation: AtomicU64,
}

impl ActivationState {
    /// Open the window; returns the generation token guarding this activation
    /// against a newer one re-arming the timer.
    pub fn activate(&self) -> u64 {
        self.activated.store(true, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn deactivate(&self) {
        self.activated.store(false, Ordering::SeqCst);
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn set_tool_pending(&self, pending: bool) {
        self.tool_pending.store(pending, Ordering::SeqCst);
    }

    pub fn is_tool_pending(&self) -> bool {
        self.tool_pending.load(Ordering::SeqCst)
    }

    /// Deactivation must wait while either of these holds.
    pub fn busy(&self) -> bool {
        self.is_speaking() || self.is_tool_pending()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Wait out one activation window, deferring while the agent is mid-speech or
/// mid-tool-call. Returns true if this call performed the deactivation (the
/// caller should tear down a wake-mode session), false if a newer activation
/// superseded it.
pub async fn run_activation_window(
    state: Arc<ActivationState>,
    generation: u64,
    window: Duration,
    poll: Duration,
) -> bool {
    tokio::time::sleep(window).await;
    loop {
        if state.current_generation() != generation {
            return false;
        }
        if !state.busy() {
            break;
        }
        tokio::time::sleep(poll).await;
    }
    if state.current_generation() != generation {
        return false;
    }
    state.deactivate();
    true
}

/// External reasoning function invoked by the delegate tool.
#[async_trait]
pub trait ToolDelegate: Send + Sync {
    async fn answer(&self, question: &str) -> Result<String>;
}

/// Delegate over a plain HTTP endpoint.
pub struct HttpToolDelegate {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpToolDelegate {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl ToolDelegate for HttpToolDelegate {
    async fn answer(&self, question: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "question": question }))
            .send()
            .await
            .context("Delegate request failed")?;
        anyhow::ensure!(
            response.status().is_success(),
            "Delegate returned {}",
            response.status()
        );
        let payload: serde_json::Value = response
            .json()
            .await
            .context("Delegate response was not JSON")?;
        payload
            .get("answer")
            .and_then(serde_json::Value::as_str)
            .map(String::from)
            .context("Delegate response missing 'answer'")
    }
}

/// Used when no delegate endpoint is configured.
pub struct NoDelegate;

#[async_trait]
impl ToolDelegate for NoDelegate {
    async fn answer(&self, _question: &str) -> Result<String> {
        anyhow::bail!("No reasoning delegate configured")
    }
}

/// The fixed client-tool table: one delegate tool.
pub const DELEGATE_TOOL: &str = "ask_assistant";

/// Build the configured provider.
pub fn build_assistant(config: &AgentConfig) -> Result<Arc<dyn VoiceAssistant>> {
    let delegate: Arc<dyn ToolDelegate> = match &config.delegate_endpoint {
        Some(endpoint) => Arc::new(HttpToolDelegate::new(endpoint.clone())),
        None => Arc::new(NoDelegate),
    };

    let assistant: Arc<dyn VoiceAssistant> = match config.provider {
        AgentProvider::None => Arc::new(noop::NoOpAssistant),
        AgentProvider::ElevenLabs => Arc::new(elevenlabs::ElevenLabsAssistant::new(config, delegate)?),
        AgentProvider::Nova => Arc::new(nova::NovaAssistant::new(config)?),
    };

    info!(
        "Voice assistant provider: {:?} (enabled: {})",
        config.provider,
        assistant.is_enabled()
    );
    Ok(assistant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_window_deactivates_when_idle() {
        let state = Arc::new(ActivationState::default());
        let generation = state.activate();
        assert!(state.is_activated());

        let owned = run_activation_window(
            state.clone(),
            generation,
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await;

        assert!(owned);
        assert!(!state.is_activated());
    }

    #[tokio::test]
    async fn test_deactivation_deferred_while_speaking() {
        let state = Arc::new(ActivationState::default());
        let generation = state.activate();
        state.set_speaking(true);

        let timer = tokio::spawn(run_activation_window(
            state.clone(),
            generation,
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));

        // Well past the window, still speaking: must remain activated.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.is_activated());

        // Goes idle: deactivation lands within one poll interval.
        state.set_speaking(false);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!state.is_activated());
        assert!(timer.await.unwrap());
    }

    #[tokio::test]
    async fn test_deactivation_deferred_while_tool_pending() {
        let state = Arc::new(ActivationState::default());
        let generation = state.activate();
        state.set_tool_pending(true);

        let timer = tokio::spawn(run_activation_window(
            state.clone(),
            generation,
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(state.is_activated());

        state.set_tool_pending(false);
        assert!(timer.await.unwrap());
        assert!(!state.is_activated());
    }

    #[tokio::test]
    async fn test_superseded_window_does_not_deactivate() {
        let state = Arc::new(ActivationState::default());
        let first = state.activate();

        let timer = tokio::spawn(run_activation_window(
            state.clone(),
            first,
            Duration::from_millis(10),
            Duration::from_millis(5),
        ));

        // A newer activation arrives before the first window expires.
        let _second = state.activate();
        let owned = timer.await.unwrap();
        assert!(!owned);
        assert!(state.is_activated());
    }
}
