// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Publication fan-out with per-relay acknowledgement collection.
//!
//! A signed event is sent to every writable relay; OK frames whose
//! event id matches the publication are collected into an [`OkStream`]
//! bounded by the writable-relay count, at most one per relay.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::client::ClientInner;
use crate::event::Event;
use crate::relay::ConnectionState;
use crate::wire::{ClientMessage, MessagePacket, OkPacket, RelayMessage};

/// Acknowledgement stream for one publication.
///
/// Yields up to one [`OkPacket`] per writable relay, then completes.
/// Dropping it releases the fan-in listener.
pub struct OkStream {
    rx: mpsc::UnboundedReceiver<OkPacket>,
    event: Event,
    _guard: DropGuard,
}

impl OkStream {
    /// The signed event this publication carried.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Next acknowledgement, or `None` once every writable relay has
    /// answered (or the collector was released).
    pub async fn recv(&mut self) -> Option<OkPacket> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for OkStream {
    type Item = OkPacket;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Fan the signed event out to every writable relay and spawn the
/// acknowledgement collector.
pub(crate) fn spawn(inner: &Arc<ClientInner>, event: Event) -> OkStream {
    // Listener first, so an immediate OK cannot slip past the collector.
    let messages = inner.hub.subscribe_messages();

    let writable: Vec<_> = {
        let pool = inner.pool.read().unwrap_or_else(PoisonError::into_inner);
        pool.records()
            .filter(|(_, record)| record.write)
            .map(|(url, record)| (url.clone(), Arc::clone(&record.connection)))
            .collect()
    };

    let frame = ClientMessage::Event { event: event.clone() };
    for (_, connection) in &writable {
        // Write-only relays are never started by pool transitions;
        // bring them up on first use.
        if matches!(
            connection.state(),
            ConnectionState::Initialized | ConnectionState::Terminated
        ) {
            connection.start();
        }
        connection.send(&frame);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = inner.shutdown.child_token();
    let guard = cancel.clone().drop_guard();

    let expected: HashSet<String> = writable.into_iter().map(|(url, _)| url).collect();
    if expected.is_empty() {
        drop(tx); // no writable relays: the stream completes empty
    } else {
        tokio::spawn(collect(messages, tx, cancel, expected, event.id.clone()));
    }

    OkStream { rx, event, _guard: guard }
}

async fn collect(
    mut messages: broadcast::Receiver<MessagePacket>,
    tx: mpsc::UnboundedSender<OkPacket>,
    cancel: CancellationToken,
    expected: HashSet<String>,
    event_id: String,
) {
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            msg = messages.recv() => {
                let packet = match msg {
                    Ok(packet) => packet,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let MessagePacket { from, message } = packet;
                let RelayMessage::Ok { event_id: id, accepted, message } = message else {
                    continue;
                };
                // Correlate by event id so concurrent publications do
                // not cross-talk.
                if id != event_id || !expected.contains(&from) || !seen.insert(from.clone()) {
                    continue;
                }
                if tx.send(OkPacket { from, id, accepted, message }).is_err() {
                    return;
                }
                if seen.len() == expected.len() {
                    return; // W packets delivered
                }
            }
        }
    }
}
