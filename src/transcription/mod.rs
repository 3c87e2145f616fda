//! Live transcription pipeline: capture → recognize → attribute → scan.
//!
//! A capture subprocess emits raw PCM from the default sink monitor; the
//! recognizer streams it to the recognition service; final results feed the
//! caption builder and the wake-phrase buffer. While recording is paused the
//! capture loop substitutes silence so session timing is undisturbed.

pub mod captions;
pub mod recognizer;
pub mod speakers;
pub mod wake;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::VoiceAssistant;
use crate::config::{Config, ExecutionMode};
use crate::events::ingest::{IngestPublisher, MeetingEvent};
use crate::status::StatusManager;

use captions::CaptionBuilder;
use recognizer::{RecognizerEvent, RecognizerParams};
use speakers::SpeakerLog;
use wake::TranscriptBuffer;

/// Word-level item inside a transcript segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordItem {
    pub content: String,
    pub kind: WordKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordKind {
    Word,
    Punctuation,
}

/// 100ms of 16-bit mono PCM.
fn chunk_size(sample_rate: u32) -> usize {
    (sample_rate as usize / 10) * 2
}

struct Running {
    child: tokio::process::Child,
    tasks: Vec<JoinHandle<()>>,
}

pub struct TranscriptionService {
    params: RecognizerParams,
    execution_mode: ExecutionMode,
    status: Arc<StatusManager>,
    ingest: IngestPublisher,
    agent: Arc<dyn VoiceAssistant>,
    call_id: String,
    recording_enabled: Arc<AtomicBool>,
    speakers: Arc<Mutex<SpeakerLog>>,
    captions: Arc<Mutex<CaptionBuilder>>,
    buffer: Arc<Mutex<TranscriptBuffer>>,
    capture_pending: Arc<AtomicBool>,
    session_announced: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

impl TranscriptionService {
    pub fn new(
        config: &Config,
        status: Arc<StatusManager>,
        ingest: IngestPublisher,
        agent: Arc<dyn VoiceAssistant>,
        call_id: String,
        recording_enabled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            params: RecognizerParams {
                endpoint: config.recognition_endpoint.clone(),
                api_key: config.recognition_api_key.clone(),
                sample_rate: config.sample_rate,
                language: config.recognition_language.clone(),
            },
            execution_mode: config.execution_mode,
            status,
            ingest,
            agent,
            call_id,
            recording_enabled,
            speakers: Arc::new(Mutex::new(SpeakerLog::default())),
            captions: Arc::new(Mutex::new(CaptionBuilder::default())),
            buffer: Arc::new(Mutex::new(TranscriptBuffer::default())),
            capture_pending: Arc::new(AtomicBool::new(false)),
            session_announced: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    /// Report an active-speaker change observed by the automation layer.
    pub async fn speaker_change(&self, name: String) {
        debug!("Active speaker: {}", name);
        self.speakers.lock().await.push(name);
    }

    pub async fn captions_snapshot(&self) -> Vec<String> {
        self.captions.lock().await.lines().to_vec()
    }

    /// Start the capture-and-recognize loop. Idempotent while running.
    pub async fn start_transcription(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Transcription already running");
            return Ok(());
        }

        let sample_rate = self.params.sample_rate;
        let mut child = tokio::process::Command::new("parec")
            .arg("--format=s16le")
            .arg(format!("--rate={}", sample_rate))
            .arg("--channels=1")
            .arg("--device=@DEFAULT_MONITOR@")
            .arg("--raw")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn audio capture subprocess")?;
        let stdout = child.stdout.take().context("Capture subprocess has no stdout")?;

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(32);
        let (events_tx, events_rx) = mpsc::channel::<RecognizerEvent>(64);

        let capture_task = tokio::spawn(capture_loop(
            stdout,
            chunk_size(sample_rate),
            self.recording_enabled.clone(),
            self.agent.clone(),
            audio_tx,
        ));

        let recognizer_task = {
            let service = self.clone();
            let params = self.params.clone();
            tokio::spawn(async move {
                if let Err(e) = recognizer::run(params, audio_rx, events_tx).await {
                    service.handle_stream_failure(e).await;
                }
            })
        };

        let consumer_task = {
            let service = self.clone();
            tokio::spawn(async move { service.consume_results(events_rx).await })
        };

        *running = Some(Running {
            child,
            tasks: vec![capture_task, recognizer_task, consumer_task],
        });
        info!("Transcription started ({} Hz)", sample_rate);
        Ok(())
    }

    /// Stop capture and close the recognition session.
    pub async fn stop_transcription(&self) {
        let mut running = self.running.lock().await;
        if let Some(mut state) = running.take() {
            if let Err(e) = state.child.kill().await {
                warn!("Failed to kill capture subprocess: {}", e);
            }
            for task in state.tasks {
                task.abort();
            }
            info!("Transcription stopped");
        }
    }

    /// Policy point for unrecoverable stream errors: fatal in production,
    /// logged in local test.
    async fn handle_stream_failure(&self, error: anyhow::Error) {
        if self.execution_mode.stream_errors_fatal() {
            error!("Unrecoverable recognition failure, exiting: {:#}", error);
            std::process::exit(1);
        }
        warn!("Recognition stream stopped (local test mode): {:#}", error);
    }

    async fn consume_results(self: Arc<Self>, mut events_rx: mpsc::Receiver<RecognizerEvent>) {
        while let Some(event) = events_rx.recv().await {
            match event {
                RecognizerEvent::SessionStarted { session_id } => {
                    info!(
                        "Recognition session established{}",
                        session_id
                            .as_deref()
                            .map(|id| format!(" ({})", id))
                            .unwrap_or_default()
                    );
                    if !self.session_announced.swap(true, Ordering::SeqCst) {
                        self.status.set_active().await;
                    }
                }
                RecognizerEvent::Result(result) => self.handle_result(result).await,
            }
        }
    }

    async fn handle_result(&self, result: recognizer::RecognitionResult) {
        // Attribute to whoever was active when the segment began; the segment
        // arrives roughly when the speech ends, so its start is one duration
        // back from now. A speaker first seen mid-segment still attributes.
        let speaker = {
            let duration = result.end_ms.saturating_sub(result.start_ms);
            let spoke_at = Utc::now() - chrono::Duration::milliseconds(duration as i64);
            let speakers = self.speakers.lock().await;
            speakers
                .speaker_at(spoke_at)
                .or_else(|| speakers.current())
                .map(String::from)
        };

        // Every result, interim or final, is republished as-is downstream.
        self.ingest
            .publish(MeetingEvent::TranscriptSegment {
                call_id: self.call_id.clone(),
                payload: result.raw.clone(),
                speaker: speaker.clone(),
            })
            .await;

        if result.partial || result.text.is_empty() {
            return;
        }

        let speaker_name = speaker.unwrap_or_else(|| "Speaker".to_string());
        self.captions
            .lock()
            .await
            .append(&speaker_name, Utc::now(), &result.words);

        let matched = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(result.text.clone());
            wake::find_wake_phrase(&wake::normalize(&buffer.text()))
        };

        if let Some(phrase) = matched {
            self.maybe_activate(phrase).await;
        }
    }

    /// Kick off a wake-phrase capture unless the agent is unavailable, already
    /// listening, or a capture is in flight.
    async fn maybe_activate(&self, phrase: &'static str) {
        if !self.agent.is_enabled() || self.agent.is_activated() {
            return;
        }
        if self.capture_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Wake phrase detected: '{}'", phrase);
        let matched_at = Instant::now();
        let buffer = self.buffer.clone();
        let agent = self.agent.clone();
        let capture_pending = self.capture_pending.clone();

        tokio::spawn(async move {
            // Let trailing words of the same utterance arrive first.
            tokio::time::sleep(wake::SETTLE_DELAY).await;
            let context = {
                let buffer = buffer.lock().await;
                wake::activation_context(&buffer, matched_at, phrase)
            };
            capture_pending.store(false, Ordering::SeqCst);

            let context = (!context.is_empty()).then_some(context);
            if let Err(e) = agent.activate(None, context).await {
                warn!("Agent activation failed: {:#}", e);
            }
        });
    }
}

/// Read PCM chunks from the capture subprocess, substituting silence while
/// recording is paused, and fan out to recognition and (when listening) the
/// voice agent.
async fn capture_loop(
    mut stdout: tokio::process::ChildStdout,
    chunk: usize,
    recording_enabled: Arc<AtomicBool>,
    agent: Arc<dyn VoiceAssistant>,
    audio_tx: mpsc::Sender<Vec<u8>>,
) {
    let mut buf = vec![0u8; chunk];
    loop {
        match stdout.read_exact(&mut buf).await {
            Ok(_) => {
                let frame = if recording_enabled.load(Ordering::SeqCst) {
                    buf.clone()
                } else {
                    vec![0u8; chunk]
                };

                if agent.is_activated() {
                    if let Err(e) = agent.send_audio_chunk(&frame).await {
                        debug!("Agent audio forward failed: {:#}", e);
                    }
                }

                if audio_tx.send(frame).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Capture stream ended: {}", e);
                break;
            }
        }
    }
    // Dropping audio_tx terminates the recognition session cleanly.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_is_100ms_of_s16le() {
        assert_eq!(chunk_size(16_000), 3_200);
        assert_eq!(chunk_size(8_000), 1_600);
    }

    #[test]
    fn test_word_kind_serialization() {
        let item = WordItem {
            content: ",".to_string(),
            kind: WordKind::Punctuation,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "punctuation");
    }
}
