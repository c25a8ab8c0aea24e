// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared client state: the fan-in hub every relay connection publishes
//! into, and the aggregate structures owned by the client handle.

use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::wire::{ConnectionStatePacket, ErrorPacket, MessagePacket};

/// Broadcast capacity per packet kind.
const HUB_CAPACITY: usize = 256;

/// Fan-in hub: every transport publishes parsed messages, state
/// transitions and terminal errors here; aggregators and subscription
/// engines subscribe.
///
/// Senders live behind a lock so `dispose()` can drop them, which
/// completes every outstanding fan-in stream.
pub(crate) struct Hub {
    messages: RwLock<Option<broadcast::Sender<MessagePacket>>>,
    states: RwLock<Option<broadcast::Sender<ConnectionStatePacket>>>,
    errors: RwLock<Option<broadcast::Sender<ErrorPacket>>>,
}

impl Hub {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(HUB_CAPACITY);
        let (states, _) = broadcast::channel(HUB_CAPACITY);
        let (errors, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            messages: RwLock::new(Some(messages)),
            states: RwLock::new(Some(states)),
            errors: RwLock::new(Some(errors)),
        }
    }

    pub fn publish_message(&self, packet: MessagePacket) {
        let guard = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(packet);
        }
    }

    pub fn publish_state(&self, packet: ConnectionStatePacket) {
        let guard = self.states.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(packet);
        }
    }

    pub fn publish_error(&self, packet: ErrorPacket) {
        let guard = self.errors.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(packet);
        }
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<MessagePacket> {
        let guard = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        }
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<ConnectionStatePacket> {
        let guard = self.states.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        }
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorPacket> {
        let guard = self.errors.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        }
    }

    /// Drop all senders; every fan-in receiver observes channel close.
    pub fn close(&self) {
        self.messages.write().unwrap_or_else(PoisonError::into_inner).take();
        self.states.write().unwrap_or_else(PoisonError::into_inner).take();
        self.errors.write().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// A receiver whose channel is already closed, handed out after dispose.
fn closed_receiver<T: Clone>() -> broadcast::Receiver<T> {
    let (tx, rx) = broadcast::channel(1);
    drop(tx);
    rx
}
