//! Nova bidirectional speech-to-speech stream.
//!
//! One long-lived WebSocket per meeting carrying enveloped events: a session
//! and prompt are opened up front, an audio content block stays open for the
//! meeting, and text turns are injected as their own content blocks. Output
//! audio arrives in many small chunks, so the reader batches them before
//! enqueueing playback.

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
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::playback::PlaybackQueue;
use super::{run_activation_window, ActivationState, VoiceAssistant, DEFER_POLL};
use crate::config::{ActivationMode, AgentConfig};

const SYSTEM_PROMPT: &str = "You are a helpful meeting participant. Keep spoken \
answers brief and conversational. Only respond when directly addressed.";

/// Output chunks per playback batch.
const BATCH_CHUNKS: usize = 10;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Accumulates decoded output audio into fixed-count batches so playback
/// writes are not dominated by per-chunk overhead.
#[derive(Default)]
pub struct AudioBatcher {
    chunks: Vec<Vec<u8>>,
}

impl AudioBatcher {
    /// Add one chunk; returns a concatenated batch once enough are held.
    pub fn push(&mut self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        self.chunks.push(chunk);
        (self.chunks.len() >= BATCH_CHUNKS).then(|| self.take())
    }

    /// Drain whatever is held, batch-sized or not.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        (!self.chunks.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> Vec<u8> {
        self.chunks.drain(..).flatten().collect()
    }
}

struct Session {
    out_tx: mpsc::UnboundedSender<Value>,
    prompt_name: String,
    audio_content: String,
    tasks: Vec<JoinHandle<()>>,
}

pub struct NovaAssistant {
    endpoint: String,
    model_id: String,
    mode: ActivationMode,
    window: Duration,
    input_sample_rate: u32,
    state: Arc<ActivationState>,
    playback: PlaybackQueue,
    session: Arc<Mutex<Option<Session>>>,
    active: Arc<AtomicBool>,
}

impl NovaAssistant {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let endpoint = config
            .nova_endpoint
            .clone()
            .context("NOVA_ENDPOINT is required for the nova provider")?;

        let state = Arc::new(ActivationState::default());
        let playback = PlaybackQueue::spawn(config.output_sample_rate, state.clone());

        Ok(Self {
            endpoint,
            model_id: config.nova_model_id.clone(),
            mode: config.activation_mode,
            window: config.activation_window,
            input_sample_rate: 16_000,
            state,
            playback,
            session: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Open the stream and run the session/prompt/content opening sequence.
    async fn open_session(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let (socket, _) = tokio_tungstenite::connect_async(&self.endpoint)
            .await
            .context("Nova WebSocket connect failed")?;
        info!("Nova stream opened");

        let (sink, stream) = socket.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();

        let prompt_name = Uuid::new_v4().to_string();
        let audio_content = Uuid::new_v4().to_string();
        for event in opening_sequence(&self.model_id, &prompt_name, &audio_content, self.input_sample_rate) {
            out_tx.send(event).ok();
        }

        let writer = tokio::spawn(write_loop(sink, out_rx));
        let reader = tokio::spawn(read_loop(stream, self.playback.clone()));

        *session = Some(Session {
            out_tx,
            prompt_name,
            audio_content,
            tasks: vec![writer, reader],
        });
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_session(&self) {
        let mut session = self.session.lock().await;
        if let Some(state) = session.take() {
            for event in closing_sequence(&state.prompt_name, &state.audio_content) {
                state.out_tx.send(event).ok();
            }
            // Give the writer a moment to flush the close events.
            tokio::time::sleep(Duration::from_millis(200)).await;
            for task in state.tasks {
                task.abort();
            }
            self.active.store(false, Ordering::SeqCst);
            info!("Nova stream closed");
        }
    }

}

#[async_trait]
impl VoiceAssistant for NovaAssistant {
    async fn start(&self) -> Result<()> {
        // One stream for the whole meeting regardless of mode; the activation
        // window only gates whether microphone audio is forwarded.
        self.open_session().await?;
        if self.mode == ActivationMode::AlwaysActive {
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
        if self.is_speaking() {
            return Ok(());
        }
        let session = self.session.lock().await;
        let session = session.as_ref().context("Nova stream is not open")?;
        session
            .out_tx
            .send(json!({
                "event": {
                    "audioInput": {
                        "promptName": session.prompt_name,
                        "contentName": session.audio_content,
                        "content": BASE64.encode(pcm),
                    }
                }
            }))
            .context("Nova writer is gone")
    }

    async fn send_user_message(&self, text: &str) -> Result<()> {
        let (prompt_name, events) = {
            let session = self.session.lock().await;
            let session = session.as_ref().context("Nova stream is not open")?;
            (session.prompt_name.clone(), session.out_tx.clone())
        };
        for event in text_turn(&prompt_name, "USER", text) {
            events.send(event).context("Nova writer is gone")?;
        }
        Ok(())
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
        let window = window.unwrap_or(self.window);
        tokio::spawn(async move {
            // The stream stays open between activations; the window only
            // closes the listening gate.
            run_activation_window(state, generation, window, DEFER_POLL).await;
        });
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.state.deactivate();
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

/// Events that open a session: session, prompt, system text turn, and the
/// long-lived audio content block.
fn opening_sequence(
    model_id: &str,
    prompt_name: &str,
    audio_content: &str,
    sample_rate: u32,
) -> Vec<Value> {
    let mut events = vec![
        json!({
            "event": {
                "sessionStart": {
                    "inferenceConfiguration": {
                        "maxTokens": 1024,
                        "topP": 0.9,
                        "temperature": 0.7,
                    }
                }
            }
        }),
        json!({
            "event": {
                "promptStart": {
                    "promptName": prompt_name,
                    "modelId": model_id,
                    "audioOutputConfiguration": {
                        "mediaType": "audio/lpcm",
                        "sampleRateHertz": 24_000,
                        "sampleSizeBits": 16,
                        "channelCount": 1,
                        "encoding": "base64",
                    },
                }
            }
        }),
    ];
    events.extend(text_turn(prompt_name, "SYSTEM", SYSTEM_PROMPT));
    events.push(json!({
        "event": {
            "contentStart": {
                "promptName": prompt_name,
                "contentName": audio_content,
                "type": "AUDIO",
                "interactive": true,
                "role": "USER",
                "audioInputConfiguration": {
                    "mediaType": "audio/lpcm",
                    "sampleRateHertz": sample_rate,
                    "sampleSizeBits": 16,
                    "channelCount": 1,
                    "encoding": "base64",
                },
            }
        }
    }));
    events
}

/// A complete text content block: start, input, end.
fn text_turn(prompt_name: &str, role: &str, text: &str) -> Vec<Value> {
    let content_name = Uuid::new_v4().to_string();
    vec![
        json!({
            "event": {
                "contentStart": {
                    "promptName": prompt_name,
                    "contentName": content_name,
                    "type": "TEXT",
                    "interactive": true,
                    "role": role,
                    "textInputConfiguration": { "mediaType": "text/plain" },
                }
            }
        }),
        json!({
            "event": {
                "textInput": {
                    "promptName": prompt_name,
                    "contentName": content_name,
                    "content": text,
                }
            }
        }),
        json!({
            "event": {
                "contentEnd": {
                    "promptName": prompt_name,
                    "contentName": content_name,
                }
            }
        }),
    ]
}

fn closing_sequence(prompt_name: &str, audio_content: &str) -> Vec<Value> {
    vec![
        json!({
            "event": {
                "contentEnd": {
                    "promptName": prompt_name,
                    "contentName": audio_content,
                }
            }
        }),
        json!({ "event": { "promptEnd": { "promptName": prompt_name } } }),
        json!({ "event": { "sessionEnd": {} } }),
    ]
}

async fn write_loop(mut sink: SplitSink<Socket, Message>, mut out_rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(event) = out_rx.recv().await {
        if let Err(e) = sink.send(Message::Text(event.to_string())).await {
            warn!("Nova send failed: {}", e);
            break;
        }
    }
}

async fn read_loop(mut stream: SplitStream<Socket>, playback: PlaybackQueue) {
    let mut batcher = AudioBatcher::default();
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let Some(event) = value.get("event") else {
            continue;
        };

        if let Some(content) = event.pointer("/audioOutput/content").and_then(Value::as_str) {
            match BASE64.decode(content) {
                Ok(pcm) => {
                    if let Some(batch) = batcher.push(pcm) {
                        playback.enqueue(batch);
                    }
                }
                Err(e) => warn!("Undecodable output audio: {}", e),
            }
        } else if let Some(text) = event.pointer("/textOutput/content").and_then(Value::as_str) {
            debug!("Model text: {}", text);
        } else if event.get("contentEnd").is_some() {
            // Turn boundary: play out whatever is buffered.
            if let Some(batch) = batcher.flush() {
                playback.enqueue(batch);
            }
        }
    }
    if let Some(batch) = batcher.flush() {
        playback.enqueue(batch);
    }
    debug!("Nova read loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batcher_emits_every_ten_chunks() {
        let mut batcher = AudioBatcher::default();
        for i in 0..9 {
            assert!(batcher.push(vec![i]).is_none());
        }
        let batch = batcher.push(vec![9]).unwrap();
        assert_eq!(batch, (0..10).collect::<Vec<u8>>());
        assert!(batcher.flush().is_none());
    }

    #[test]
    fn test_batcher_flush_returns_partial() {
        let mut batcher = AudioBatcher::default();
        assert!(batcher.push(b"ab".to_vec()).is_none());
        assert!(batcher.push(b"cd".to_vec()).is_none());
        assert_eq!(batcher.flush().unwrap(), b"abcd");
    }

    #[test]
    fn test_opening_sequence_shape() {
        let events = opening_sequence("amazon.nova-sonic-v1:0", "p1", "a1", 16_000);
        assert!(events[0].pointer("/event/sessionStart").is_some());
        assert!(events[1].pointer("/event/promptStart").is_some());
        // System text turn in the middle, audio block last.
        assert_eq!(
            events[3].pointer("/event/textInput/content").and_then(Value::as_str),
            Some(SYSTEM_PROMPT)
        );
        let last = events.last().unwrap();
        assert_eq!(
            last.pointer("/event/contentStart/type").and_then(Value::as_str),
            Some("AUDIO")
        );
        assert_eq!(
            last.pointer("/event/contentStart/contentName").and_then(Value::as_str),
            Some("a1")
        );
    }

    #[test]
    fn test_closing_sequence_order() {
        let events = closing_sequence("p1", "a1");
        assert!(events[0].pointer("/event/contentEnd").is_some());
        assert!(events[1].pointer("/event/promptEnd").is_some());
        assert!(events[2].pointer("/event/sessionEnd").is_some());
    }
}
