// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription engine: attaches subscription ids to caller-emitted
//! filter lists, drives REQ/CLOSE emission through the pool, and routes
//! matching EVENT frames back to the caller.
//!
//! Strategies:
//! - `forward`: one sub id for the life of the subscription; every
//!   filter emission re-sends under the same id and updates the
//!   Active-REQ registry so later pool additions catch up.
//! - `backward`: a fresh `id:index` per emission; each inner
//!   subscription tracks per-relay EOSE, closes relays as they drain,
//!   and completes on the drain predicate or idle timeout.
//! - `oneshot`: backward semantics for exactly the first emission.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::client::ClientInner;
use crate::event::Filter;
use crate::relay::ConnectionState;
use crate::wire::{ClientMessage, EventPacket, MessagePacket, RelayMessage};

/// How subscription ids are attached to filter emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStrategy {
    Forward,
    Backward,
    Oneshot,
}

/// Caller side of a request source: emit filter lists into the engine.
#[derive(Debug, Clone)]
pub struct ReqEmitter {
    tx: mpsc::UnboundedSender<Vec<Filter>>,
}

impl ReqEmitter {
    /// Emit a filter list. An empty list is ignored by the engine.
    /// Returns false once the subscription is gone.
    pub fn emit(&self, filters: Vec<Filter>) -> bool {
        self.tx.send(filters).is_ok()
    }
}

/// A request source bound to [`NostrClient::subscribe`](crate::NostrClient::subscribe).
pub struct ReqSource {
    pub(crate) id: String,
    pub(crate) strategy: ReqStrategy,
    pub(crate) filters_rx: mpsc::UnboundedReceiver<Vec<Filter>>,
}

impl ReqSource {
    fn with_strategy(id: impl Into<String>, strategy: ReqStrategy) -> (Self, ReqEmitter) {
        let (tx, filters_rx) = mpsc::unbounded_channel();
        (Self { id: id.into(), strategy, filters_rx }, ReqEmitter { tx })
    }

    pub fn forward(id: impl Into<String>) -> (Self, ReqEmitter) {
        Self::with_strategy(id, ReqStrategy::Forward)
    }

    pub fn backward(id: impl Into<String>) -> (Self, ReqEmitter) {
        Self::with_strategy(id, ReqStrategy::Backward)
    }

    pub fn oneshot(id: impl Into<String>) -> (Self, ReqEmitter) {
        Self::with_strategy(id, ReqStrategy::Oneshot)
    }
}

/// `"{rxReqId}:{index}"`, unique within a client instance.
pub(crate) fn make_sub_id(id: &str, index: u64) -> String {
    format!("{id}:{index}")
}

/// The caller's event stream.
///
/// Dropping it finalizes the subscription: a CLOSE is enqueued to every
/// relay whose active set holds one of its sub ids, the forward registry
/// entry is removed, and the engine task is cancelled.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<EventPacket>,
    _guard: SubGuard,
}

impl EventSubscription {
    /// Next event, or `None` once the subscription has completed.
    pub async fn recv(&mut self) -> Option<EventPacket> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for EventSubscription {
    type Item = EventPacket;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct SubGuard {
    inner: Arc<ClientInner>,
    owned: Arc<Mutex<HashSet<String>>>,
    forward_id: Option<String>,
    cancel: CancellationToken,
}

impl Drop for SubGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        finalize(&self.inner, &self.owned, self.forward_id.as_deref());
    }
}

/// CLOSE every still-active sub id across the pool and drop the forward
/// registry entry. Idempotent: `close_sub` is membership-gated.
fn finalize(inner: &ClientInner, owned: &Mutex<HashSet<String>>, forward_id: Option<&str>) {
    if let Some(sub_id) = forward_id {
        inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sub_id);
    }
    let ids: Vec<String> = {
        let mut owned = owned.lock().unwrap_or_else(PoisonError::into_inner);
        owned.drain().collect()
    };
    if ids.is_empty() {
        return;
    }
    let pool = inner.pool.read().unwrap_or_else(PoisonError::into_inner);
    for (_, record) in pool.records() {
        for sub_id in &ids {
            record.connection.close_sub(sub_id);
        }
    }
}

/// Bind a request source: spawn the engine task and hand the caller its
/// event stream.
pub(crate) fn spawn(inner: &Arc<ClientInner>, source: ReqSource) -> EventSubscription {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let owned = Arc::new(Mutex::new(HashSet::new()));
    let cancel = inner.shutdown.child_token();
    let forward_id = matches!(source.strategy, ReqStrategy::Forward)
        .then(|| make_sub_id(&source.id, 0));

    let guard = SubGuard {
        inner: Arc::clone(inner),
        owned: Arc::clone(&owned),
        forward_id,
        cancel: cancel.clone(),
    };

    // On a disposed client the stream completes immediately.
    if inner.disposed.load(std::sync::atomic::Ordering::Relaxed) {
        drop(out_tx);
        return EventSubscription { rx: out_rx, _guard: guard };
    }

    let engine = Engine {
        inner: Arc::clone(inner),
        strategy: source.strategy,
        source_id: source.id.clone(),
        timeout: inner.config.timeout(),
        out_tx,
        owned,
        inners: HashMap::new(),
        index: 0,
        input_done: false,
        oneshot_fired: false,
    };
    tokio::spawn(engine.run(source.filters_rx, cancel));

    EventSubscription { rx: out_rx, _guard: guard }
}

/// Per-sub-id state for backward/oneshot inner subscriptions.
struct InnerSub {
    /// Relays the REQ was sent to; the completion predicate ranges over
    /// these.
    targets: Vec<String>,
    /// Relays that have delivered EOSE for this sub id.
    eose: HashSet<String>,
    deadline: Instant,
    done: bool,
}

struct Engine {
    inner: Arc<ClientInner>,
    strategy: ReqStrategy,
    source_id: String,
    timeout: Duration,
    out_tx: mpsc::UnboundedSender<EventPacket>,
    owned: Arc<Mutex<HashSet<String>>>,
    inners: HashMap<String, InnerSub>,
    index: u64,
    input_done: bool,
    oneshot_fired: bool,
}

impl Engine {
    async fn run(
        mut self,
        mut filters_rx: mpsc::UnboundedReceiver<Vec<Filter>>,
        cancel: CancellationToken,
    ) {
        let mut messages = self.inner.hub.subscribe_messages();
        let mut states = self.inner.hub.subscribe_states();

        loop {
            if self.outer_done() {
                return; // dropping out_tx completes the caller stream
            }

            let next_deadline = self.next_deadline();
            let deadline = next_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = cancel.cancelled() => return,

                filters = filters_rx.recv(), if !self.input_done => {
                    match filters {
                        Some(filters) if filters.is_empty() => {} // null emission
                        Some(filters) => self.handle_emission(filters),
                        None => self.input_done = true,
                    }
                }

                msg = messages.recv() => {
                    match msg {
                        Ok(packet) => self.handle_message(packet),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(source = %self.source_id, skipped = n, "subscription lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }

                st = states.recv() => {
                    match st {
                        Ok(_) => self.handle_state_change(),
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }

                _ = tokio::time::sleep_until(deadline), if next_deadline.is_some() => {
                    self.fire_timeouts();
                }
            }
        }
    }

    // -- emission -------------------------------------------------------------

    fn handle_emission(&mut self, filters: Vec<Filter>) {
        match self.strategy {
            ReqStrategy::Forward => self.emit_forward(filters),
            ReqStrategy::Oneshot => {
                if !self.oneshot_fired {
                    self.oneshot_fired = true;
                    self.emit_inner(filters);
                }
            }
            ReqStrategy::Backward => self.emit_inner(filters),
        }
    }

    /// Forward: same sub id every time, registry updated, sent to every
    /// readable relay regardless of active-set membership.
    fn emit_forward(&mut self, filters: Vec<Filter>) {
        let sub_id = make_sub_id(&self.source_id, 0);
        let req = ClientMessage::Req { sub_id: sub_id.clone(), filters };

        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&sub_id, req.clone());
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sub_id);

        let pool = self.inner.pool.read().unwrap_or_else(PoisonError::into_inner);
        for (_, record) in pool.records() {
            if record.read {
                record.connection.send(&req);
            }
        }
    }

    /// Backward/oneshot: fresh sub id, sent only to readable relays not
    /// already carrying it.
    fn emit_inner(&mut self, filters: Vec<Filter>) {
        let sub_id = make_sub_id(&self.source_id, self.index);
        self.index += 1;
        let req = ClientMessage::Req { sub_id: sub_id.clone(), filters };

        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sub_id.clone());

        let mut targets = Vec::new();
        {
            let pool = self.inner.pool.read().unwrap_or_else(PoisonError::into_inner);
            for (url, record) in pool.records() {
                if record.read && !record.connection.has_sub(&sub_id) {
                    record.connection.send(&req);
                    targets.push(url.clone());
                }
            }
        }

        self.inners.insert(
            sub_id.clone(),
            InnerSub {
                targets,
                eose: HashSet::new(),
                deadline: Instant::now() + self.timeout,
                done: false,
            },
        );
        // An empty pool drains vacuously.
        self.evaluate_inner(&sub_id);
    }

    // -- inbound routing ------------------------------------------------------

    fn handle_message(&mut self, packet: MessagePacket) {
        match packet.message {
            RelayMessage::Event { sub_id, event } => {
                self.handle_event(packet.from, sub_id, event);
            }
            RelayMessage::Eose { sub_id } => self.handle_eose(&packet.from, &sub_id),
            _ => {}
        }
    }

    fn handle_event(&mut self, from: String, sub_id: String, event: crate::event::Event) {
        let owns = self
            .owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&sub_id);

        match self.strategy {
            ReqStrategy::Forward => {
                if owns {
                    let _ = self.out_tx.send(EventPacket { from, sub_id, event });
                }
            }
            ReqStrategy::Backward | ReqStrategy::Oneshot => {
                let Some(inner) = self.inners.get_mut(&sub_id) else { return };
                // Late events after completion, and events from relays
                // that already sent EOSE, are dropped.
                if inner.done || inner.eose.contains(&from) {
                    return;
                }
                inner.deadline = Instant::now() + self.timeout;
                let _ = self.out_tx.send(EventPacket { from, sub_id, event });
            }
        }
    }

    fn handle_eose(&mut self, from: &str, sub_id: &str) {
        if self.strategy == ReqStrategy::Forward {
            return;
        }
        {
            let Some(inner) = self.inners.get_mut(sub_id) else { return };
            if inner.done || !inner.eose.insert(from.to_owned()) {
                return; // duplicate EOSE from one relay is ignored
            }
            inner.deadline = Instant::now() + self.timeout;
        }
        {
            let pool = self.inner.pool.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(record) = pool.get(from) {
                record.connection.close_sub(sub_id);
            }
        }
        self.evaluate_inner(sub_id);
    }

    /// Connection-state transitions are completion triggers: they reset
    /// idle windows and re-evaluate every open inner subscription.
    fn handle_state_change(&mut self) {
        if self.strategy == ReqStrategy::Forward {
            return;
        }
        let now = Instant::now();
        let open: Vec<String> = self
            .inners
            .iter()
            .filter(|(_, i)| !i.done)
            .map(|(id, _)| id.clone())
            .collect();
        for sub_id in &open {
            if let Some(inner) = self.inners.get_mut(sub_id) {
                inner.deadline = now + self.timeout;
            }
        }
        for sub_id in open {
            self.evaluate_inner(&sub_id);
        }
    }

    // -- completion -----------------------------------------------------------

    fn evaluate_inner(&mut self, sub_id: &str) {
        let complete = {
            let Some(inner) = self.inners.get(sub_id) else { return };
            if inner.done {
                return;
            }
            let pool = self.inner.pool.read().unwrap_or_else(PoisonError::into_inner);
            inner_complete(&inner.targets, &inner.eose, |url| {
                pool.get(url).map(|record| record.connection.state())
            })
        };
        if complete {
            self.complete_inner(sub_id);
        }
    }

    /// Mark an inner subscription done and CLOSE it on every relay still
    /// holding it.
    fn complete_inner(&mut self, sub_id: &str) {
        let targets = {
            let Some(inner) = self.inners.get_mut(sub_id) else { return };
            if inner.done {
                return;
            }
            inner.done = true;
            inner.targets.clone()
        };
        self.owned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(sub_id);

        let pool = self.inner.pool.read().unwrap_or_else(PoisonError::into_inner);
        for url in &targets {
            if let Some(record) = pool.get(url) {
                record.connection.close_sub(sub_id);
            }
        }
    }

    fn fire_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .inners
            .iter()
            .filter(|(_, i)| !i.done && i.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for sub_id in expired {
            tracing::debug!(sub_id = %sub_id, "inner subscription timed out");
            self.complete_inner(&sub_id);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inners.values().filter(|i| !i.done).map(|i| i.deadline).min()
    }

    fn outer_done(&self) -> bool {
        let all_done = self.inners.values().all(|i| i.done);
        match self.strategy {
            ReqStrategy::Forward => false,
            ReqStrategy::Backward => self.input_done && all_done,
            ReqStrategy::Oneshot => {
                (self.oneshot_fired && all_done) || (self.input_done && !self.oneshot_fired)
            }
        }
    }
}

/// The drain predicate: an inner subscription is complete when every
/// targeted relay is terminal, or ongoing and past its EOSE. A target
/// gone from the pool counts as terminal.
fn inner_complete<F>(targets: &[String], eose: &HashSet<String>, state_of: F) -> bool
where
    F: Fn(&str) -> Option<ConnectionState>,
{
    targets.iter().all(|url| match state_of(url) {
        None => true,
        Some(state) if state.is_terminal() => true,
        Some(ConnectionState::Ongoing) => eose.contains(url),
        Some(_) => false,
    })
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
