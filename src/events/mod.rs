//! Signed publish/subscribe WebSocket client.
//!
//! Speaks the `aws-appsync-event-ws` framing: the negotiated subprotocol
//! carries the fixed marker plus a base64url blob of signed headers, and
//! every subscribe/publish frame embeds its own signed authorization object.
//! Dropped connections are re-established with bounded exponential backoff,
//! after which all live subscriptions are replayed.

pub mod ingest;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::signing::{self, SigningCredentials};

const SUBPROTOCOL: &str = "aws-appsync-event-ws";
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt `attempt` (1-based): doubling from the
/// base, capped. Non-decreasing by construction.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CAP)
}

pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;

enum Command {
    Subscribe {
        channel: String,
        callback: EventCallback,
        reply: oneshot::Sender<Result<String>>,
    },
    Unsubscribe {
        id: String,
    },
    Publish {
        channel: String,
        event: Value,
    },
    Close,
}

/// Handle to the connection driver task.
#[derive(Clone)]
pub struct EventsClient {
    tx: mpsc::Sender<Command>,
}

impl EventsClient {
    /// Connect and spawn the driver task. Fails if the first connection
    /// cannot be established.
    pub async fn connect(config: &Config) -> Result<Self> {
        let endpoint = config
            .events_endpoint
            .clone()
            .context("No events endpoint configured")?;
        let credentials = match (&config.signing_access_key, &config.signing_secret_key) {
            (Some(access_key), Some(secret_key)) => Some(SigningCredentials {
                access_key: access_key.clone(),
                secret_key: secret_key.clone(),
                region: config.region.clone(),
                service: "appsync".to_string(),
            }),
            _ => None,
        };

        let socket = open_socket(&endpoint, credentials.as_ref()).await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(drive(socket, endpoint, credentials, rx));
        Ok(Self { tx })
    }

    /// Subscribe to a channel; returns the locally generated subscription id.
    pub async fn subscribe(&self, channel: &str, callback: EventCallback) -> Result<String> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::Subscribe {
                channel: channel.to_string(),
                callback,
                reply,
            })
            .await
            .context("Events client is gone")?;
        response.await.context("Events client dropped the request")?
    }

    pub async fn unsubscribe(&self, id: &str) {
        let _ = self.tx.send(Command::Unsubscribe { id: id.to_string() }).await;
    }

    pub async fn publish(&self, channel: &str, event: Value) -> Result<()> {
        self.tx
            .send(Command::Publish {
                channel: channel.to_string(),
                event,
            })
            .await
            .context("Events client is gone")?;
        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.tx.send(Command::Close).await;
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn auth_object(
    endpoint: &str,
    credentials: Option<&SigningCredentials>,
    body: &str,
) -> Result<Value> {
    let host = signing::host_of(endpoint)?;
    match credentials {
        Some(credentials) => {
            let headers = signing::sign_request(credentials, &host, "/event", body)?;
            Ok(json!(headers))
        }
        None => Ok(json!({ "host": host })),
    }
}

async fn open_socket(endpoint: &str, credentials: Option<&SigningCredentials>) -> Result<Socket> {
    let auth = auth_object(endpoint, credentials, "{}")?;
    let header_blob = URL_SAFE_NO_PAD.encode(auth.to_string());

    let mut request = endpoint
        .into_client_request()
        .context("Invalid events endpoint")?;
    let protocols = format!("{}, header-{}", SUBPROTOCOL, header_blob);
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_str(&protocols).context("Signed header blob is not header-safe")?,
    );

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .context("Events WebSocket connect failed")?;
    info!("Events connection established");
    Ok(socket)
}

struct Subscription {
    channel: String,
    callback: EventCallback,
}

async fn drive(
    mut socket: Socket,
    endpoint: String,
    credentials: Option<SigningCredentials>,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut subscriptions: HashMap<String, Subscription> = HashMap::new();

    'connection: loop {
        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(Command::Subscribe { channel, callback, reply }) => {
                            let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
                            let result = send_subscribe(&mut socket, &endpoint, credentials.as_ref(), &id, &channel).await;
                            if result.is_ok() {
                                subscriptions.insert(id.clone(), Subscription { channel, callback });
                            }
                            let _ = reply.send(result.map(|_| id));
                        }
                        Some(Command::Unsubscribe { id }) => {
                            subscriptions.remove(&id);
                            let frame = json!({ "type": "unsubscribe", "id": id }).to_string();
                            let _ = socket.send(Message::Text(frame)).await;
                        }
                        Some(Command::Publish { channel, event }) => {
                            if let Err(e) = send_publish(&mut socket, &endpoint, credentials.as_ref(), &channel, &event).await {
                                warn!("Publish to {} failed: {:#}", channel, e);
                            }
                        }
                        Some(Command::Close) | None => {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                }
                frame = socket.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => dispatch(&subscriptions, &text),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Events connection error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        // Connection dropped: bounded reconnect, then replay subscriptions.
        let mut attempt = 1u32;
        loop {
            if attempt > MAX_RECONNECT_ATTEMPTS {
                warn!(
                    "Events reconnect budget ({}) exhausted, giving up",
                    MAX_RECONNECT_ATTEMPTS
                );
                return;
            }
            let delay = backoff_delay(attempt);
            debug!("Events reconnect attempt {} in {:?}", attempt, delay);
            tokio::time::sleep(delay).await;

            match open_socket(&endpoint, credentials.as_ref()).await {
                Ok(new_socket) => {
                    socket = new_socket;
                    for (id, sub) in &subscriptions {
                        if let Err(e) =
                            send_subscribe(&mut socket, &endpoint, credentials.as_ref(), id, &sub.channel)
                                .await
                        {
                            warn!("Failed to re-subscribe {}: {:#}", sub.channel, e);
                        }
                    }
                    info!("Events connection re-established ({} subscriptions)", subscriptions.len());
                    continue 'connection;
                }
                Err(e) => {
                    warn!("Events reconnect attempt {} failed: {:#}", attempt, e);
                    attempt += 1;
                }
            }
        }
    }
}

fn dispatch(subscriptions: &HashMap<String, Subscription>, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        warn!("Unparseable events frame: {}", text);
        return;
    };
    match frame.get("type").and_then(Value::as_str) {
        Some("data") => {
            let id = frame.get("id").and_then(Value::as_str).unwrap_or_default();
            if let Some(sub) = subscriptions.get(id) {
                if let Some(event) = frame.get("event") {
                    // Events arrive as serialized JSON strings.
                    let payload = match event.as_str() {
                        Some(raw) => serde_json::from_str(raw).unwrap_or(Value::String(raw.to_string())),
                        None => event.clone(),
                    };
                    (sub.callback)(payload);
                }
            }
        }
        // Keep-alives and ack frames carry nothing actionable.
        Some("ka") | Some("subscribe_success") | Some("publish_success") | Some("connection_ack") => {}
        Some(other) => debug!("Ignoring events frame type '{}'", other),
        None => warn!("Events frame without type: {}", text),
    }
}

async fn send_subscribe(
    socket: &mut Socket,
    endpoint: &str,
    credentials: Option<&SigningCredentials>,
    id: &str,
    channel: &str,
) -> Result<()> {
    let body = json!({ "channel": channel }).to_string();
    let frame = json!({
        "type": "subscribe",
        "id": id,
        "channel": channel,
        "authorization": auth_object(endpoint, credentials, &body)?,
    });
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .context("Subscribe frame failed")
}

async fn send_publish(
    socket: &mut Socket,
    endpoint: &str,
    credentials: Option<&SigningCredentials>,
    channel: &str,
    event: &Value,
) -> Result<()> {
    let serialized = event.to_string();
    let body = json!({ "channel": channel, "events": [serialized] }).to_string();
    let frame = json!({
        "type": "publish",
        "id": uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
        "channel": channel,
        "events": [serialized],
        "authorization": auth_object(endpoint, credentials, &body)?,
    });
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .context("Publish frame failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_caps_and_never_decreases() {
        let mut previous = Duration::ZERO;
        for attempt in 1..40 {
            let delay = backoff_delay(attempt);
            assert!(delay >= previous, "delay decreased at attempt {}", attempt);
            assert!(delay <= BACKOFF_CAP);
            previous = delay;
        }
        assert_eq!(backoff_delay(30), BACKOFF_CAP);
    }

    #[test]
    fn test_dispatch_routes_by_subscription_id() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let mut subscriptions = HashMap::new();
        subscriptions.insert(
            "sub1".to_string(),
            Subscription {
                channel: "meetings/abc".to_string(),
                callback: Arc::new(move |event| {
                    assert_eq!(event.get("n").and_then(Value::as_i64), Some(7));
                    hits_clone.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        // Serialized-event form.
        dispatch(
            &subscriptions,
            r#"{"type":"data","id":"sub1","event":"{\"n\":7}"}"#,
        );
        // Unknown id is ignored.
        dispatch(
            &subscriptions,
            r#"{"type":"data","id":"other","event":"{\"n\":7}"}"#,
        );
        // Keep-alive is ignored.
        dispatch(&subscriptions, r#"{"type":"ka"}"#);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
