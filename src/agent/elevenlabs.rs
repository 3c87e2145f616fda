//! ElevenLabs conversational-agent session.
//!
//! A bidirectional JSON-over-WebSocket conversation. In always-active mode
//! the session opens at start; in wake-phrase mode it opens on first
//! activation and is torn down on deactivation so idle meetings cost nothing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::playback::PlaybackQueue;
use super::{
    run_activation_window, ActivationState, ToolDelegate, VoiceAssistant, DEFER_POLL,
    DELEGATE_TOOL,
};
use crate::config::{ActivationMode, AgentConfig};

const ENDPOINT: &str = "wss://api.elevenlabs.io/v1/convai/conversation";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Session {
    out_tx: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ElevenLabsAssistant {
    agent_id: String,
    api_key: String,
    mode: ActivationMode,
    window: Duration,
    state: Arc<ActivationState>,
    delegate: Arc<dyn ToolDelegate>,
    playback: PlaybackQueue,
    session: Arc<Mutex<Option<Session>>>,
    active: Arc<AtomicBool>,
}

impl ElevenLabsAssistant {
    pub fn new(config: &AgentConfig, delegate: Arc<dyn ToolDelegate>) -> Result<Self> {
        let agent_id = config
            .elevenlabs_agent_id
            .clone()
            .context("ELEVENLABS_AGENT_ID is required for the elevenlabs provider")?;
        let api_key = config
            .elevenlabs_api_key
            .clone()
            .context("ELEVENLABS_API_KEY is required for the elevenlabs provider")?;

        let state = Arc::new(ActivationState::default());
        let playback = PlaybackQueue::spawn(config.output_sample_rate, state.clone());

        Ok(Self {
            agent_id,
            api_key,
            mode: config.activation_mode,
            window: config.activation_window,
            state,
            delegate,
            playback,
            session: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn open_session(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let url = format!("{}?agent_id={}", ENDPOINT, self.agent_id);
        let mut request = url.into_client_request().context("Invalid agent endpoint")?;
        request.headers_mut().insert(
            "xi-api-key",
            HeaderValue::from_str(&self.api_key).context("API key is not header-safe")?,
        );

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("Agent WebSocket connect failed")?;
        info!("Agent session opened");

        let (sink, stream) = socket.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();

        out_tx
            .send(Message::Text(
                json!({ "type": "conversation_initiation_client_data" }).to_string(),
            ))
            .ok();

        let writer = tokio::spawn(write_loop(sink, out_rx));
        let reader = tokio::spawn(read_loop(
            stream,
            out_tx.clone(),
            self.playback.clone(),
            self.state.clone(),
            self.delegate.clone(),
        ));

        *session = Some(Session {
            out_tx,
            tasks: vec![writer, reader],
        });
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_session(&self) {
        let mut session = self.session.lock().await;
        if let Some(state) = session.take() {
            for task in state.tasks {
                task.abort();
            }
            self.active.store(false, Ordering::SeqCst);
            info!("Agent session closed");
        }
    }

    async fn send_frame(&self, frame: Value) -> Result<()> {
        let session = self.session.lock().await;
        let session = session.as_ref().context("Agent session is not open")?;
        session
            .out_tx
            .send(Message::Text(frame.to_string()))
            .context("Agent session writer is gone")
    }
}

#[async_trait]
impl VoiceAssistant for ElevenLabsAssistant {
    async fn start(&self) -> Result<()> {
        if self.mode == ActivationMode::AlwaysActive {
            self.open_session().await?;
            self.state.activate();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.deactivate();
        self.close_session().await;
        Ok(())
    }

    async fn send_audio_chunk(&self, pcm: &[u8]) -> Result<()> {
        // Feedback guard: never feed the agent its own playback.
        if self.is_speaking() {
            return Ok(());
        }
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.send_frame(json!({ "user_audio_chunk": BASE64.encode(pcm) }))
            .await
    }

    async fn send_user_message(&self, text: &str) -> Result<()> {
        self.send_frame(json!({ "type": "user_message", "text": text }))
            .await
    }

    async fn activate(&self, window: Option<Duration>, context: Option<String>) -> Result<()> {
        self.open_session().await?;
        let generation = self.state.activate();

        if let Some(context) = context {
            if let Err(e) = self.send_user_message(&context).await {
                warn!("Failed to send activation context: {:#}", e);
            }
        }

        let state = self.state.clone();
        let session = self.session.clone();
        let active = self.active.clone();
        let mode = self.mode;
        let window = window.unwrap_or(self.window);

        tokio::spawn(async move {
            let owned = run_activation_window(state, generation, window, DEFER_POLL).await;
            if owned && mode == ActivationMode::WakePhrase {
                let mut session = session.lock().await;
                if let Some(state) = session.take() {
                    for task in state.tasks {
                        task.abort();
                    }
                    active.store(false, Ordering::SeqCst);
                    info!("Agent session closed after activation window");
                }
            }
        });
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.state.deactivate();
        if self.mode == ActivationMode::WakePhrase {
            self.close_session().await;
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn is_activated(&self) -> bool {
        self.state.is_activated()
    }

    fn is_speaking(&self) -> bool {
        self.playback.is_active() || self.state.is_speaking()
    }
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = out_rx.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!("Agent send failed: {}", e);
            break;
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<Socket>,
    out_tx: mpsc::UnboundedSender<Message>,
    playback: PlaybackQueue,
    state: Arc<ActivationState>,
    delegate: Arc<dyn ToolDelegate>,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        match value.get("type").and_then(Value::as_str) {
            Some("audio") => {
                if let Some(encoded) = value.pointer("/audio_event/audio_base_64").and_then(Value::as_str) {
                    match BASE64.decode(encoded) {
                        Ok(pcm) => playback.enqueue(pcm),
                        Err(e) => warn!("Undecodable agent audio: {}", e),
                    }
                }
            }
            Some("ping") => {
                let event_id = value.pointer("/ping_event/event_id").cloned().unwrap_or(Value::Null);
                let _ = out_tx.send(Message::Text(
                    json!({ "type": "pong", "event_id": event_id }).to_string(),
                ));
            }
            Some("client_tool_call") => {
                handle_tool_call(&value, out_tx.clone(), state.clone(), delegate.clone());
            }
            Some("agent_response") => {
                let text = frame_text(&value, "/agent_response_event/agent_response");
                debug!("Agent response: {}", text);
            }
            Some("user_transcript") => {
                let text = frame_text(&value, "/user_transcription_event/user_transcript");
                debug!("Agent heard: {}", text);
            }
            _ => {}
        }
    }
    debug!("Agent read loop ended");
}

fn frame_text<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

/// Resolve a client tool call against the tool table and answer it. The
/// pending flag defers deactivation until the result is sent.
fn handle_tool_call(
    value: &Value,
    out_tx: mpsc::UnboundedSender<Message>,
    state: Arc<ActivationState>,
    delegate: Arc<dyn ToolDelegate>,
) {
    let call = value.get("client_tool_call").cloned().unwrap_or(Value::Null);
    let tool_name = call
        .get("tool_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_call_id = call.get("tool_call_id").cloned().unwrap_or(Value::Null);
    let parameters = call.get("parameters").cloned().unwrap_or(Value::Null);

    state.set_tool_pending(true);
    tokio::spawn(async move {
        let outcome = if tool_name == DELEGATE_TOOL {
            let question = parameters
                .get("question")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| parameters.to_string());
            delegate.answer(&question).await
        } else {
            Err(anyhow::anyhow!("Unknown tool '{}'", tool_name))
        };

        let (result, is_error) = match outcome {
            Ok(answer) => (answer, false),
            Err(e) => {
                warn!("Tool call '{}' failed: {:#}", tool_name, e);
                (e.to_string(), true)
            }
        };

        let _ = out_tx.send(Message::Text(
            json!({
                "type": "client_tool_result",
                "tool_call_id": tool_call_id,
                "result": result,
                "is_error": is_error,
            })
            .to_string(),
        ));
        state.set_tool_pending(false);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoDelegate;
    use crate::config::AgentProvider;

    fn config() -> AgentConfig {
        AgentConfig {
            provider: AgentProvider::ElevenLabs,
            activation_mode: ActivationMode::WakePhrase,
            activation_window: Duration::from_secs(30),
            elevenlabs_agent_id: Some("agent-1".to_string()),
            elevenlabs_api_key: Some("key".to_string()),
            nova_endpoint: None,
            nova_model_id: "amazon.nova-sonic-v1:0".to_string(),
            output_sample_rate: 16_000,
            delegate_endpoint: None,
        }
    }

    #[tokio::test]
    async fn test_requires_credentials() {
        let mut incomplete = config();
        incomplete.elevenlabs_api_key = None;
        assert!(ElevenLabsAssistant::new(&incomplete, Arc::new(NoDelegate)).is_err());
    }

    #[tokio::test]
    async fn test_starts_inactive_in_wake_mode() {
        let assistant = ElevenLabsAssistant::new(&config(), Arc::new(NoDelegate)).unwrap();
        assert!(assistant.is_enabled());
        assert!(!assistant.is_active());
        assert!(!assistant.is_activated());
        // Audio before any session is silently dropped rather than an error.
        assistant.send_audio_chunk(&[0u8; 320]).await.unwrap();
    }

    #[test]
    fn test_frame_text_extraction() {
        let frame = json!({
            "type": "agent_response",
            "agent_response_event": { "agent_response": "On it." },
        });
        assert_eq!(frame_text(&frame, "/agent_response_event/agent_response"), "On it.");
        assert_eq!(frame_text(&frame, "/user_transcription_event/user_transcript"), "");
    }
}
