// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One WebSocket connection per relay URL, with bounded automatic
//! reconnection.
//!
//! - `start()` opens a *lifetime*: a background task that connects,
//!   reads frames, and drains the outgoing queue.
//! - Frames enqueued before the first successful open of a lifetime are
//!   flushed once the socket opens; frames arriving while disconnected
//!   are dropped. A CLOSE is never written to a non-open socket.
//! - Retry budget exhaustion transitions to `Error`, emits one
//!   `ErrorPacket`, and clears the active-subscription set.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::state::Hub;
use crate::wire::{ClientMessage, ConnectionStatePacket, ErrorPacket, MessagePacket, RelayMessage};

/// Initial reconnect backoff; doubles up to [`MAX_BACKOFF_MS`].
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initialized,
    Starting,
    Ongoing,
    Reconnecting,
    Error,
    Terminated,
    Rejected,
}

impl ConnectionState {
    /// True for states a connection never leaves within one lifetime.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Terminated | Self::Rejected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Ongoing => "ongoing",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Terminated => "terminated",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Outgoing queue + cancel token for one `start()`..`stop()` lifetime.
struct Lifetime {
    frame_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

/// A single relay's transport.
pub struct RelayConnection {
    url: String,
    config: ClientConfig,
    hub: Arc<Hub>,
    shutdown: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    /// Subscription ids with a REQ sent and no CLOSE yet.
    active_subs: RwLock<HashSet<String>>,
    lifetime: Mutex<Option<Lifetime>>,
    disposed: AtomicBool,
}

impl RelayConnection {
    pub(crate) fn new(
        url: String,
        config: ClientConfig,
        hub: Arc<Hub>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Initialized);
        Self {
            url,
            config,
            hub,
            shutdown,
            state_tx,
            active_subs: RwLock::new(HashSet::new()),
            lifetime: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch every state transition of this connection.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Begin a connection lifetime. No-op while one is already running
    /// or after `dispose()`.
    pub fn start(self: &Arc<Self>) {
        if self.disposed.load(Ordering::Relaxed) {
            return;
        }
        let mut lifetime = self.lifetime.lock().unwrap_or_else(PoisonError::into_inner);
        if lifetime.as_ref().is_some_and(|l| !l.cancel.is_cancelled()) {
            return;
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        *lifetime = Some(Lifetime { frame_tx, cancel: cancel.clone() });
        drop(lifetime);

        self.transition(ConnectionState::Starting);
        let conn = Arc::clone(self);
        tokio::spawn(conn.run_loop(frame_rx, cancel));
    }

    /// End the current lifetime, preserving the connection for a later
    /// `start()`. Idempotent.
    pub fn stop(&self) {
        let taken = {
            let mut lifetime = self.lifetime.lock().unwrap_or_else(PoisonError::into_inner);
            lifetime.take()
        };
        if let Some(l) = taken {
            l.cancel.cancel();
        }
        self.transition(ConnectionState::Terminated);
    }

    /// Terminal: stop and refuse all further operations.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Relaxed);
        self.stop();
    }

    /// Enqueue a frame for this relay.
    ///
    /// Active-subscription bookkeeping happens here, synchronously: a
    /// REQ inserts its sub id, a CLOSE removes it. Without a running
    /// lifetime the frame is dropped.
    pub fn send(&self, message: &ClientMessage) {
        if self.disposed.load(Ordering::Relaxed) {
            return;
        }
        let frame_tx = {
            let lifetime = self.lifetime.lock().unwrap_or_else(PoisonError::into_inner);
            match lifetime.as_ref().filter(|l| !l.cancel.is_cancelled()) {
                Some(l) => l.frame_tx.clone(),
                None => {
                    tracing::debug!(relay = %self.url, "dropping frame, no active lifetime");
                    return;
                }
            }
        };

        match message {
            ClientMessage::Req { sub_id, .. } => {
                self.active_subs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(sub_id.clone());
            }
            ClientMessage::Close { sub_id } => {
                self.active_subs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(sub_id);
            }
            _ => {}
        }

        let _ = frame_tx.send(message.to_json());
    }

    /// Send a CLOSE for `sub_id` iff it is active here. Returns whether
    /// a CLOSE was attempted, making repeated finalization a no-op.
    pub fn close_sub(&self, sub_id: &str) -> bool {
        let present = self
            .active_subs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sub_id);
        if !present {
            return false;
        }
        let lifetime = self.lifetime.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(l) = lifetime.as_ref().filter(|l| !l.cancel.is_cancelled()) {
            let frame = ClientMessage::Close { sub_id: sub_id.to_owned() };
            let _ = l.frame_tx.send(frame.to_json());
        }
        true
    }

    /// Whether `sub_id` currently has a REQ outstanding on this relay.
    pub fn has_sub(&self, sub_id: &str) -> bool {
        self.active_subs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(sub_id)
    }

    /// Snapshot of the active subscription ids.
    pub fn active_subs(&self) -> Vec<String> {
        self.active_subs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn transition(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::debug!(relay = %self.url, from = %prev, to = %next, "connection state");
            self.hub
                .publish_state(ConnectionStatePacket { from: self.url.clone(), state: next });
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        mut frame_rx: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        let mut attempts: u32 = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            if attempts > 0 {
                self.transition(ConnectionState::Starting);
            }

            match tokio_tungstenite::connect_async(&self.url).await {
                Ok((ws_stream, _)) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    attempts = 0;
                    backoff_ms = INITIAL_BACKOFF_MS;
                    self.transition(ConnectionState::Ongoing);

                    let (mut write, mut read) = ws_stream.split();

                    loop {
                        tokio::select! {
                            // Frames enqueued before a stop() are flushed
                            // ahead of the cancellation branch.
                            biased;

                            frame = frame_rx.recv() => {
                                match frame {
                                    Some(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            tracing::debug!(relay = %self.url, "write failed");
                                            break;
                                        }
                                    }
                                    None => return, // connection dropped
                                }
                            }

                            _ = cancel.cancelled() => {
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }

                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        self.handle_incoming(text.as_str());
                                    }
                                    Some(Ok(Message::Close(_))) | None => {
                                        tracing::debug!(relay = %self.url, "socket closed by relay");
                                        break;
                                    }
                                    Some(Err(e)) => {
                                        tracing::debug!(relay = %self.url, err = %e, "socket error");
                                        break;
                                    }
                                    _ => {} // ping/pong/binary ignored
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    if matches!(e, WsError::Http(_)) {
                        tracing::warn!(relay = %self.url, err = %e, "relay rejected connection");
                        // Terminal for this lifetime: later sends drop and
                        // a fresh start() is allowed again.
                        cancel.cancel();
                        self.transition(ConnectionState::Rejected);
                        return;
                    }
                    tracing::debug!(relay = %self.url, err = %e, backoff_ms, "connect failed");
                }
            }

            if cancel.is_cancelled() {
                return;
            }

            attempts += 1;
            if attempts > self.config.retry {
                tracing::warn!(relay = %self.url, attempts, "retry budget exhausted");
                cancel.cancel();
                self.transition(ConnectionState::Error);
                self.active_subs.write().unwrap_or_else(PoisonError::into_inner).clear();
                self.hub.publish_error(ErrorPacket {
                    from: self.url.clone(),
                    reason: format!("retry budget exhausted after {attempts} attempts"),
                });
                return;
            }
            self.transition(ConnectionState::Reconnecting);

            // Backoff before reconnect, dropping frames while down.
            let sleep = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = &mut sleep => break,
                    frame = frame_rx.recv() => {
                        match frame {
                            Some(_) => {
                                tracing::debug!(relay = %self.url, "dropping frame while disconnected");
                            }
                            None => return,
                        }
                    }
                }
            }
            backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
        }
    }

    fn handle_incoming(&self, text: &str) {
        match RelayMessage::parse(text) {
            Some(message) => {
                self.hub
                    .publish_message(MessagePacket { from: self.url.clone(), message });
            }
            None => {
                tracing::debug!(relay = %self.url, "suppressing malformed frame");
            }
        }
    }
}
