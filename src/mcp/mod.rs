//! Bridge between remotely issued tool commands and a local tool server.
//!
//! The tool server is a subprocess speaking JSON-RPC over stdio. Commands
//! arrive on a per-meeting pub/sub channel; each one is parsed, invoked
//! against the matching local tool, timed, and answered on the same channel
//! keyed by the command id.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::events::{EventCallback, EventsClient};

/// Channel names are length-limited, so the meeting channel is derived from a
/// truncated hash of the call id.
pub fn command_channel(call_id: &str) -> String {
    let digest = Sha256::digest(call_id.as_bytes());
    format!("mcp/{}", hex::encode(&digest[..4]))
}

struct Pending {
    map: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    closed: AtomicBool,
}

/// JSON-RPC client over a spawned tool-server subprocess.
pub struct McpClient {
    child: Mutex<tokio::process::Child>,
    writer_tx: mpsc::UnboundedSender<String>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
}

impl McpClient {
    /// Spawn the server and run the JSON-RPC initialize handshake.
    pub async fn spawn(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().context("Empty tool server command")?;

        let mut child = tokio::process::Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("Failed to spawn tool server")?;

        let stdin = child.stdin.take().context("Tool server has no stdin")?;
        let stdout = child.stdout.take().context("Tool server has no stdout")?;

        let pending = Arc::new(Pending {
            map: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = writer_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        let pending_reader = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(value) = serde_json::from_str::<Value>(&line) else {
                    debug!("Non-JSON line from tool server: {}", line);
                    continue;
                };
                let Some(id) = value.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                if let Some(reply) = pending_reader.map.lock().await.remove(&id) {
                    let _ = reply.send(value);
                }
            }
            debug!("Tool server stdout closed");
            // Fail every in-flight request. The flag is set first so a
            // request racing this cleanup either gets its sender dropped
            // here or sees the flag after inserting.
            pending_reader.closed.store(true, Ordering::SeqCst);
            pending_reader.map.lock().await.clear();
        });

        let client = Self {
            child: Mutex::new(child),
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
        };

        client
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": { "name": "standin", "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await
            .context("Tool server initialize failed")?;
        client.notify("notifications/initialized", json!({}))?;
        Ok(client)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.map.lock().await.insert(id, tx);

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.writer_tx
            .send(frame.to_string())
            .context("Tool server stdin is closed")?;

        if self.pending.closed.load(Ordering::SeqCst) {
            self.pending.map.lock().await.remove(&id);
            bail!("Tool server has exited");
        }
        let response = rx.await.context("Tool server exited mid-request")?;
        if let Some(error) = response.get("error") {
            bail!("Tool server error: {}", error);
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.writer_tx
            .send(frame.to_string())
            .context("Tool server stdin is closed")
    }

    pub async fn list_tools(&self) -> Result<Vec<String>> {
        let result = self.request("tools/list", json!({})).await?;
        Ok(result
            .pointer("/tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!("Tool server already exited: {}", e);
        }
    }
}

/// Subscribes to the meeting command channel and serves tool invocations.
pub struct McpCommandHandler {
    client: Arc<McpClient>,
    events: EventsClient,
    channel: String,
    subscription: Mutex<Option<String>>,
}

impl McpCommandHandler {
    pub async fn start(
        command_line: &str,
        events: EventsClient,
        call_id: &str,
    ) -> Result<Arc<Self>> {
        let client = Arc::new(McpClient::spawn(command_line).await?);
        let tools = client.list_tools().await?;
        info!("Tool server ready with {} tools: {:?}", tools.len(), tools);

        let handler = Arc::new(Self {
            client,
            events,
            channel: command_channel(call_id),
            subscription: Mutex::new(None),
        });

        let callback: EventCallback = {
            let handler = handler.clone();
            Arc::new(move |event| {
                let handler = handler.clone();
                tokio::spawn(async move { handler.handle_command(event).await });
            })
        };

        let id = handler.events.subscribe(&handler.channel, callback).await?;
        *handler.subscription.lock().await = Some(id);
        info!("Listening for tool commands on {}", handler.channel);
        Ok(handler)
    }

    /// One remote command: `{ "id": ..., "tool": ..., "arguments": {...} }`.
    async fn handle_command(&self, event: Value) {
        let command_id = event.get("id").cloned().unwrap_or(Value::Null);
        let Some(tool) = event.get("tool").and_then(Value::as_str) else {
            warn!("Tool command without a tool name: {}", event);
            return;
        };
        let arguments = event.get("arguments").cloned().unwrap_or(json!({}));

        debug!("Invoking tool '{}'", tool);
        let started = Instant::now();
        let outcome = self.client.call_tool(tool, arguments).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(result) => json!({
                "id": command_id,
                "success": true,
                "result": result,
                "elapsedMs": elapsed_ms,
            }),
            Err(e) => json!({
                "id": command_id,
                "success": false,
                "error": e.to_string(),
                "elapsedMs": elapsed_ms,
            }),
        };

        if let Err(e) = self.events.publish(&self.channel, result).await {
            warn!("Failed to publish tool result: {:#}", e);
        }
    }

    pub async fn stop(&self) {
        if let Some(id) = self.subscription.lock().await.take() {
            self.events.unsubscribe(&id).await;
        }
        self.client.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_channel_is_short_and_stable() {
        let a = command_channel("call-1234");
        let b = command_channel("call-1234");
        assert_eq!(a, b);
        assert!(a.starts_with("mcp/"));
        // 4 hash bytes as hex.
        assert_eq!(a.len(), "mcp/".len() + 8);
    }

    #[test]
    fn test_command_channel_differs_per_call() {
        assert_ne!(command_channel("call-a"), command_channel("call-b"));
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_server_exits() {
        // A server that completes the handshake and then goes away.
        let script = std::env::temp_dir().join(format!(
            "standin-tool-server-{}.sh",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(
            &script,
            "read line\nprintf '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\\n'\n",
        )
        .unwrap();

        let client = McpClient::spawn(&format!("sh {}", script.display()))
            .await
            .unwrap();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            client.call_tool("echo", json!({})),
        )
        .await
        .expect("call must resolve once the server is gone");
        assert!(outcome.is_err());

        client.shutdown().await;
        let _ = std::fs::remove_file(&script);
    }
}
