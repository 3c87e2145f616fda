//! Streaming recognition session.
//!
//! One WebSocket session per run, fed raw PCM and yielding interim/final
//! results. Transient failures re-establish the session up to a fixed retry
//! budget, resuming with the previous session identifier when the service
//! hands one out.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{WordItem, WordKind};

/// Establishment retries after the initial attempt.
pub const MAX_SESSION_RETRIES: u32 = 5;
/// Delay between establishment attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Whether a failed attempt number (1-based count of consecutive failures)
/// still has retry budget. The counter resets once a session begins, so only
/// back-to-back failures spend it.
pub fn should_retry(failures: u32) -> bool {
    failures <= MAX_SESSION_RETRIES
}

#[derive(Debug, Clone)]
pub struct RecognizerParams {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub sample_rate: u32,
    pub language: String,
}

/// One recognition result, interim or final.
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    /// Raw service payload, republished downstream as-is.
    pub raw: Value,
    pub text: String,
    pub partial: bool,
    pub words: Vec<WordItem>,
    pub start_ms: u64,
    pub end_ms: u64,
}

#[derive(Debug)]
pub enum RecognizerEvent {
    /// Session is live; emitted once per (re)establishment.
    SessionStarted { session_id: Option<String> },
    Result(RecognitionResult),
}

enum SessionEnd {
    /// Audio input closed and the session terminated cleanly.
    Finished,
}

/// Drive recognition until the audio channel closes or the retry budget is
/// spent. The caller decides whether exhaustion is fatal.
pub async fn run(
    params: RecognizerParams,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    events_tx: mpsc::Sender<RecognizerEvent>,
) -> Result<()> {
    let mut session_id: Option<String> = None;
    let mut failures = 0u32;

    loop {
        match run_session(&params, &mut session_id, &mut failures, &mut audio_rx, &events_tx).await {
            Ok(SessionEnd::Finished) => return Ok(()),
            Err(e) => {
                failures += 1;
                if !should_retry(failures) {
                    return Err(e).with_context(|| {
                        format!(
                            "Recognition stream failed after {} retries",
                            MAX_SESSION_RETRIES
                        )
                    });
                }
                warn!(
                    "Recognition session error ({}/{} retries used): {:#}",
                    failures, MAX_SESSION_RETRIES, e
                );
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}

fn session_url(params: &RecognizerParams, resume: &Option<String>) -> String {
    let mut url = format!(
        "{}?sample_rate={}&language={}",
        params.endpoint, params.sample_rate, params.language
    );
    if let Some(key) = &params.api_key {
        url.push_str(&format!("&token={}", key));
    }
    if let Some(session) = resume {
        url.push_str(&format!("&session_id={}", session));
    }
    url
}

async fn run_session(
    params: &RecognizerParams,
    session_id: &mut Option<String>,
    failures: &mut u32,
    audio_rx: &mut mpsc::Receiver<Vec<u8>>,
    events_tx: &mpsc::Sender<RecognizerEvent>,
) -> Result<SessionEnd> {
    let url = session_url(params, session_id);
    let (mut socket, _) = tokio_tungstenite::connect_async(&url)
        .await
        .context("Recognition WebSocket connect failed")?;

    if session_id.is_some() {
        info!("Recognition session resumed");
    }

    loop {
        tokio::select! {
            chunk = audio_rx.recv() => {
                match chunk {
                    Some(pcm) => {
                        let frame = json!({ "audio_data": BASE64.encode(&pcm) }).to_string();
                        socket
                            .send(Message::Text(frame))
                            .await
                            .context("Failed to send audio frame")?;
                    }
                    None => {
                        // Input closed: terminate cleanly.
                        let _ = socket
                            .send(Message::Text(json!({ "terminate_session": true }).to_string()))
                            .await;
                        let _ = socket.close(None).await;
                        return Ok(SessionEnd::Finished);
                    }
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(&text, session_id, events_tx).await? {
                            *failures = 0;
                        }
                    }
                    Some(Ok(Message::Close(reason))) => {
                        anyhow::bail!("Recognition session closed: {:?}", reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Recognition transport error"),
                    None => anyhow::bail!("Recognition stream ended unexpectedly"),
                }
            }
        }
    }
}

/// Returns `true` when the frame announced a live session, which clears the
/// consecutive-failure count.
async fn handle_frame(
    text: &str,
    session_id: &mut Option<String>,
    events_tx: &mpsc::Sender<RecognizerEvent>,
) -> Result<bool> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            debug!("Unparseable recognition frame: {}", text);
            return Ok(false);
        }
    };

    match value.get("message_type").and_then(Value::as_str) {
        Some("SessionBegins") => {
            *session_id = value
                .get("session_id")
                .and_then(Value::as_str)
                .map(String::from);
            events_tx
                .send(RecognizerEvent::SessionStarted {
                    session_id: session_id.clone(),
                })
                .await
                .context("Recognizer consumer is gone")?;
            return Ok(true);
        }
        Some("PartialTranscript") | Some("FinalTranscript") => {
            if let Some(result) = parse_result(&value) {
                events_tx
                    .send(RecognizerEvent::Result(result))
                    .await
                    .context("Recognizer consumer is gone")?;
            }
        }
        Some("SessionTerminated") => debug!("Recognition session terminated"),
        _ => debug!("Ignoring recognition frame: {}", text),
    }
    Ok(false)
}

/// Parse a transcript frame into a result; `None` when the frame carries no
/// usable text shape.
pub fn parse_result(value: &Value) -> Option<RecognitionResult> {
    let message_type = value.get("message_type")?.as_str()?;
    let partial = message_type == "PartialTranscript";
    let text = value.get("text")?.as_str()?.to_string();

    let words = value
        .get("words")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|w| w.get("text").and_then(Value::as_str))
                .map(|token| WordItem {
                    content: token.to_string(),
                    kind: classify_token(token),
                })
                .collect()
        })
        .unwrap_or_default();

    Some(RecognitionResult {
        raw: value.clone(),
        text,
        partial,
        words,
        start_ms: value.get("audio_start").and_then(Value::as_u64).unwrap_or(0),
        end_ms: value.get("audio_end").and_then(Value::as_u64).unwrap_or(0),
    })
}

/// A token with no alphanumeric content is punctuation.
pub fn classify_token(token: &str) -> WordKind {
    if token.chars().any(|c| c.is_alphanumeric()) {
        WordKind::Word
    } else {
        WordKind::Punctuation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_budget() {
        // Five consecutive failures retry, the sixth gives up.
        for failures in 1..=5 {
            assert!(should_retry(failures), "failure {} should retry", failures);
        }
        assert!(!should_retry(6));
        assert_eq!(RETRY_DELAY, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_session_begins_clears_failure_count() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut session_id = None;

        let begins = json!({ "message_type": "SessionBegins", "session_id": "s-1" }).to_string();
        assert!(handle_frame(&begins, &mut session_id, &tx).await.unwrap());
        assert_eq!(session_id.as_deref(), Some("s-1"));
        assert!(matches!(
            rx.recv().await,
            Some(RecognizerEvent::SessionStarted { .. })
        ));

        // Transcripts and noise leave the count alone.
        let partial = json!({ "message_type": "PartialTranscript", "text": "hi" }).to_string();
        assert!(!handle_frame(&partial, &mut session_id, &tx).await.unwrap());
        assert!(!handle_frame("not json", &mut session_id, &tx).await.unwrap());
    }

    #[test]
    fn test_parse_final_result() {
        let frame = json!({
            "message_type": "FinalTranscript",
            "text": "hello world.",
            "audio_start": 100,
            "audio_end": 1500,
            "words": [
                { "text": "hello" },
                { "text": "world" },
                { "text": "." },
            ],
        });

        let result = parse_result(&frame).unwrap();
        assert!(!result.partial);
        assert_eq!(result.text, "hello world.");
        assert_eq!(result.start_ms, 100);
        assert_eq!(result.end_ms, 1500);
        assert_eq!(result.words.len(), 3);
        assert_eq!(result.words[2].kind, WordKind::Punctuation);
        assert_eq!(result.words[0].kind, WordKind::Word);
    }

    #[test]
    fn test_parse_partial_flag() {
        let frame = json!({ "message_type": "PartialTranscript", "text": "hel" });
        assert!(parse_result(&frame).unwrap().partial);
    }

    #[test]
    fn test_non_transcript_frames_yield_none() {
        assert!(parse_result(&json!({ "message_type": "SessionBegins" })).is_none());
        assert!(parse_result(&json!({ "text": "no type" })).is_none());
    }

    #[test]
    fn test_session_url_carries_resume_id() {
        let params = RecognizerParams {
            endpoint: "wss://stt.example.com/realtime".to_string(),
            api_key: Some("k".to_string()),
            sample_rate: 16_000,
            language: "en".to_string(),
        };
        let fresh = session_url(&params, &None);
        assert!(fresh.contains("sample_rate=16000"));
        assert!(!fresh.contains("session_id"));

        let resumed = session_url(&params, &Some("sess-9".to_string()));
        assert!(resumed.ends_with("&session_id=sess-9"));
    }
}
