// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end subscription and publication tests.
//!
//! Spawns an in-process mock relay (the server side of the Nostr wire
//! protocol) and exercises the client over real WebSockets.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use nostrmux::{ConnectionState, NostrClient};

/// Default wait for frames and state transitions.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// An in-process relay endpoint.
///
/// Captures every inbound frame (as parsed JSON) across all connections
/// and broadcasts scripted replies to whichever socket is live.
pub struct MockRelay {
    url: String,
    frames_rx: Mutex<mpsc::UnboundedReceiver<serde_json::Value>>,
    reply_tx: broadcast::Sender<String>,
    accept_task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (reply_tx, _) = broadcast::channel::<String>(64);

        let replies = reply_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let frames_tx = frames_tx.clone();
                let mut reply_rx = replies.subscribe();
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(value) = serde_json::from_str(text.as_str()) {
                                            let _ = frames_tx.send(value);
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | None => break,
                                    Some(Err(_)) => break,
                                    _ => {}
                                }
                            }
                            reply = reply_rx.recv() => {
                                match reply {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                                    Err(broadcast::error::RecvError::Closed) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            url: format!("ws://{addr}"),
            frames_rx: Mutex::new(frames_rx),
            reply_tx,
            accept_task,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue a raw frame for the connected client.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.reply_tx.send(text.into());
    }

    /// Next inbound frame from the client, within [`TIMEOUT`].
    pub async fn recv_frame(&self) -> anyhow::Result<serde_json::Value> {
        let mut rx = self.frames_rx.lock().await;
        match tokio::time::timeout(TIMEOUT, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => anyhow::bail!("mock relay inbound channel closed"),
            Err(_) => anyhow::bail!("no frame from client within {TIMEOUT:?}"),
        }
    }

    /// Assert that no inbound frame arrives within `window`.
    pub async fn expect_silence(&self, window: Duration) -> anyhow::Result<()> {
        let mut rx = self.frames_rx.lock().await;
        match tokio::time::timeout(window, rx.recv()).await {
            Ok(Some(frame)) => anyhow::bail!("unexpected frame: {frame}"),
            Ok(None) => anyhow::bail!("mock relay inbound channel closed"),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Poll until `url` reaches `state` on `client`, within [`TIMEOUT`].
pub async fn wait_for_state(
    client: &NostrClient,
    url: &str,
    state: ConnectionState,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if client.relay_state(url).ok() == Some(state) {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("relay {url} never reached {state}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A minimal valid-shaped event for relay replies; incoming signatures
/// are never verified by the client.
pub fn event_json(id_seed: u8, kind: u32) -> serde_json::Value {
    serde_json::json!({
        "id": format!("{id_seed:02x}").repeat(32),
        "pubkey": "ab".repeat(32),
        "created_at": 1_700_000_000u64,
        "kind": kind,
        "tags": [],
        "content": format!("event {id_seed}"),
        "sig": "cd".repeat(64),
    })
}
