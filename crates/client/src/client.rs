// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The client handle: pool mutations, subscription binding, publication,
//! and the fan-in aggregators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::event::{Event, EventParams};
use crate::pool::{Pool, RelayConfig, RelayStatus};
use crate::publish::OkStream;
use crate::registry::ReqRegistry;
use crate::relay::{normalize_relay_url, ConnectionState};
use crate::signer::{KeySigner, NoopSigner, Signer};
use crate::state::Hub;
use crate::subscription::{EventSubscription, ReqSource};
use crate::wire::{
    ClientMessage, ConnectionStatePacket, ErrorPacket, EventPacket, MessagePacket, RelayMessage,
};

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) pool: RwLock<Pool>,
    pub(crate) registry: RwLock<ReqRegistry>,
    pub(crate) hub: Arc<Hub>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) disposed: AtomicBool,
}

/// Multiplexes subscriptions and event publication across a dynamic
/// pool of relays. Cheap to clone; all clones share one pool.
///
/// Mutations after [`dispose`](Self::dispose) are silent no-ops.
#[derive(Clone)]
pub struct NostrClient {
    inner: Arc<ClientInner>,
}

impl NostrClient {
    /// A client whose publications require an explicit secret key.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_signer(config, Arc::new(NoopSigner))
    }

    /// A client that signs keyless publications with `signer`.
    pub fn with_signer(config: ClientConfig, signer: Arc<dyn Signer>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                signer,
                pool: RwLock::new(Pool::new()),
                registry: RwLock::new(ReqRegistry::new()),
                hub: Arc::new(Hub::new()),
                shutdown: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    fn disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Relaxed)
    }

    // -- pool -----------------------------------------------------------------

    /// Reconcile the pool toward `relays`: finalize and stop dropped
    /// readable relays, start and rehydrate added ones, dispose relays
    /// no longer present at all.
    pub fn switch_relays<I, R>(&self, relays: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<RelayConfig>,
    {
        if self.disposed() {
            return;
        }
        let configs: Vec<RelayConfig> = relays.into_iter().map(Into::into).collect();
        let mut pool = self.inner.pool.write().unwrap_or_else(PoisonError::into_inner);
        let rehydrate = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frames();
        pool.switch(
            &configs,
            &self.inner.config,
            &self.inner.hub,
            &self.inner.shutdown,
            &rehydrate,
        );
    }

    /// Single-element application of [`switch_relays`](Self::switch_relays).
    pub fn add_relay(&self, relay: impl Into<RelayConfig>) {
        if self.disposed() {
            return;
        }
        let mut pool = self.inner.pool.write().unwrap_or_else(PoisonError::into_inner);
        let mut configs = pool.configs();
        configs.push(relay.into());
        let rehydrate = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frames();
        pool.switch(
            &configs,
            &self.inner.config,
            &self.inner.hub,
            &self.inner.shutdown,
            &rehydrate,
        );
    }

    /// Single-element removal; the relay's transport is disposed.
    pub fn remove_relay(&self, url: &str) {
        if self.disposed() {
            return;
        }
        let target = normalize_relay_url(url);
        let mut pool = self.inner.pool.write().unwrap_or_else(PoisonError::into_inner);
        let configs: Vec<RelayConfig> =
            pool.configs().into_iter().filter(|c| c.url != target).collect();
        let rehydrate = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .frames();
        pool.switch(
            &configs,
            &self.inner.config,
            &self.inner.hub,
            &self.inner.shutdown,
            &rehydrate,
        );
    }

    /// Snapshot of the current pool.
    pub fn relays(&self) -> Vec<RelayStatus> {
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .statuses()
    }

    /// Connection state of one pool member; `Err` for URLs not in the
    /// pool (lookup by un-normalized URL is resolved first).
    pub fn relay_state(&self, url: &str) -> Result<ConnectionState, ClientError> {
        let target = normalize_relay_url(url);
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target)
            .map(|record| record.connection.state())
            .ok_or(ClientError::UnknownRelay(target))
    }

    /// Watch one relay's connection-state transitions directly, without
    /// the pool-wide aggregator.
    pub fn relay_state_watch(
        &self,
        url: &str,
    ) -> Result<tokio::sync::watch::Receiver<ConnectionState>, ClientError> {
        let target = normalize_relay_url(url);
        self.inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target)
            .map(|record| record.connection.state_watch())
            .ok_or(ClientError::UnknownRelay(target))
    }

    // -- subscriptions --------------------------------------------------------

    /// Bind a request source and return its event stream.
    ///
    /// Must be called within a tokio runtime; the engine runs as a
    /// background task until the stream completes or is dropped.
    pub fn subscribe(&self, source: ReqSource) -> EventSubscription {
        crate::subscription::spawn(&self.inner, source)
    }

    // -- publication ----------------------------------------------------------

    /// Sign `params` with the configured signer and send the event to
    /// every writable relay.
    pub async fn publish(&self, params: EventParams) -> Result<OkStream, ClientError> {
        if self.disposed() {
            return Err(ClientError::Disposed);
        }
        let event = self.inner.signer.sign(params).await?;
        Ok(crate::publish::spawn(&self.inner, event))
    }

    /// Sign `params` with an explicit hex secret key and publish.
    pub async fn publish_with_key(
        &self,
        params: EventParams,
        secret_hex: &str,
    ) -> Result<OkStream, ClientError> {
        if self.disposed() {
            return Err(ClientError::Disposed);
        }
        let signer = KeySigner::from_hex(secret_hex)?;
        let event = signer.sign_params(&params);
        Ok(crate::publish::spawn(&self.inner, event))
    }

    /// Send an AUTH frame to one relay, answering its challenge with a
    /// signed event. The NIP-42 handshake itself is the caller's
    /// business; this only carries the frame.
    pub fn send_auth(&self, url: &str, event: Event) -> Result<(), ClientError> {
        let target = normalize_relay_url(url);
        let pool = self.inner.pool.read().unwrap_or_else(PoisonError::into_inner);
        let record = pool
            .get(&target)
            .ok_or(ClientError::UnknownRelay(target))?;
        record.connection.send(&ClientMessage::Auth { event });
        Ok(())
    }

    // -- aggregators ----------------------------------------------------------

    /// Every parsed frame from every relay.
    pub fn all_messages(&self) -> broadcast::Receiver<MessagePacket> {
        self.inner.hub.subscribe_messages()
    }

    /// [`Stream`](futures_util::Stream) adapter over
    /// [`all_messages`](Self::all_messages); lag gaps surface as
    /// `Err(Lagged)` items.
    pub fn message_stream(&self) -> BroadcastStream<MessagePacket> {
        BroadcastStream::new(self.all_messages())
    }

    /// Every connection-state transition from every relay.
    pub fn connection_states(&self) -> broadcast::Receiver<ConnectionStatePacket> {
        self.inner.hub.subscribe_states()
    }

    /// Terminal transport failures, one per exhausted retry budget.
    pub fn all_errors(&self) -> broadcast::Receiver<ErrorPacket> {
        self.inner.hub.subscribe_errors()
    }

    /// Every EVENT frame from every relay, across all subscriptions.
    pub fn all_events(&self) -> AllEvents {
        AllEvents { rx: self.inner.hub.subscribe_messages() }
    }

    // -- lifecycle ------------------------------------------------------------

    /// Dispose every transport, complete all fan-in streams, and turn
    /// subsequent mutations into no-ops. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        {
            let mut pool = self.inner.pool.write().unwrap_or_else(PoisonError::into_inner);
            pool.dispose();
        }
        {
            let mut registry =
                self.inner.registry.write().unwrap_or_else(PoisonError::into_inner);
            registry.clear();
        }
        self.inner.hub.close();
        tracing::debug!("client disposed");
    }
}

/// Fan-in of EVENT frames only, derived from the message aggregator.
pub struct AllEvents {
    rx: broadcast::Receiver<MessagePacket>,
}

impl AllEvents {
    /// Next event from any relay, or `None` once the client is disposed.
    pub async fn recv(&mut self) -> Option<EventPacket> {
        loop {
            match self.rx.recv().await {
                Ok(MessagePacket { from, message: RelayMessage::Event { sub_id, event } }) => {
                    return Some(EventPacket { from, sub_id, event });
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
