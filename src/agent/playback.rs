//! FIFO playback of agent audio through a virtual output device.
//!
//! Chunks are written sequentially to a playback subprocess; the shared
//! speaking flag is held true from enqueue until the queue drains, which is
//! what gates microphone forwarding.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ActivationState;

#[derive(Clone)]
pub struct PlaybackQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
}

impl PlaybackQueue {
    /// Spawn the playback writer against a `pacat` subprocess.
    pub fn spawn(sample_rate: u32, state: Arc<ActivationState>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_task = pending.clone();

        tokio::spawn(async move {
            let child = tokio::process::Command::new("pacat")
                .arg("--format=s16le")
                .arg(format!("--rate={}", sample_rate))
                .arg("--channels=1")
                .arg("--raw")
                .stdin(Stdio::piped())
                .stderr(Stdio::null())
                .spawn();

            match child {
                Ok(mut child) => {
                    let Some(stdin) = child.stdin.take() else {
                        warn!("Playback subprocess has no stdin");
                        return;
                    };
                    drain_queue(rx, stdin, pending_task, state).await;
                    let _ = child.kill().await;
                }
                Err(e) => warn!("Failed to spawn playback subprocess: {}", e),
            }
        });

        Self { tx, pending }
    }

    pub fn enqueue(&self, pcm: Vec<u8>) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(pcm).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!("Playback queue closed, dropping chunk");
        }
    }

    /// True while chunks are queued or being written.
    pub fn is_active(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

/// Sequentially write queued chunks, maintaining the speaking flag.
async fn drain_queue<W: AsyncWrite + Unpin>(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    state: Arc<ActivationState>,
) {
    while let Some(chunk) = rx.recv().await {
        state.set_speaking(true);
        if let Err(e) = writer.write_all(&chunk).await {
            warn!("Playback write failed: {}", e);
            pending.fetch_sub(1, Ordering::SeqCst);
            break;
        }
        if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            state.set_speaking(false);
        }
    }
    state.set_speaking(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_chunks_play_in_fifo_order() {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (writer, mut reader) = tokio::io::duplex(1024);
        let pending = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(ActivationState::default());

        let writer_task = tokio::spawn(drain_queue(rx, writer, pending.clone(), state.clone()));

        for chunk in [b"AAAA".to_vec(), b"BBBB".to_vec(), b"CCCC".to_vec()] {
            pending.fetch_add(1, Ordering::SeqCst);
            tx.send(chunk).unwrap();
        }
        drop(tx);

        writer_task.await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"AAAABBBBCCCC");
    }

    #[tokio::test]
    async fn test_speaking_clears_after_drain() {
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (writer, _reader) = tokio::io::duplex(1024);
        let pending = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(ActivationState::default());

        let writer_task = tokio::spawn(drain_queue(rx, writer, pending.clone(), state.clone()));

        pending.fetch_add(1, Ordering::SeqCst);
        tx.send(b"shh".to_vec()).unwrap();
        drop(tx);
        writer_task.await.unwrap();

        assert!(!state.is_speaking());
        assert_eq!(pending.load(Ordering::SeqCst), 0);
    }
}
