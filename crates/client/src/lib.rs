// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Nostrmux: subscription and publication multiplexing over a dynamic
//! pool of Nostr relays.
//!
//! The client owns one WebSocket transport per relay with bounded
//! automatic reconnection, reconciles pool membership while
//! subscriptions are live, and exposes three subscription strategies
//! (`forward`, `backward`, `oneshot`) plus publication fan-out with
//! per-relay acknowledgements.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod pool;
pub mod publish;
pub(crate) mod registry;
pub mod relay;
pub mod signer;
pub(crate) mod state;
pub mod subscription;
pub mod wire;

pub use client::{AllEvents, NostrClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use event::{Event, EventParams, Filter};
pub use pool::{RelayConfig, RelayStatus};
pub use publish::OkStream;
pub use relay::ConnectionState;
pub use signer::{KeySigner, NoopSigner, Signer};
pub use subscription::{EventSubscription, ReqEmitter, ReqSource, ReqStrategy};
pub use wire::{
    ClientMessage, ConnectionStatePacket, ErrorPacket, EventPacket, MessagePacket, OkPacket,
    RelayMessage,
};
