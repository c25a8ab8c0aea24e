// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Relay pool reconciliation.
//!
//! The pool is the authoritative map from normalized URL to relay
//! record. `switch` diffs the *readable* sets of the previous and next
//! pools: dropped relays have their subscriptions finalized and are
//! stopped, added relays are started and rehydrated from the Active-REQ
//! registry, and relays absent from the next pool are disposed.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::relay::{normalize_relay_url, ConnectionState, RelayConnection};
use crate::state::Hub;
use crate::wire::ClientMessage;

/// Desired membership for one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub url: String,
    #[serde(default = "default_flag")]
    pub read: bool,
    #[serde(default = "default_flag")]
    pub write: bool,
}

fn default_flag() -> bool {
    true
}

impl RelayConfig {
    /// Read+write relay.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), read: true, write: true }
    }

    pub fn read_only(url: impl Into<String>) -> Self {
        Self { url: url.into(), read: true, write: false }
    }

    pub fn write_only(url: impl Into<String>) -> Self {
        Self { url: url.into(), read: false, write: true }
    }
}

impl From<&str> for RelayConfig {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

/// Point-in-time view of one pool member.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub url: String,
    pub read: bool,
    pub write: bool,
    pub state: ConnectionState,
}

/// One pool entry.
pub(crate) struct RelayRecord {
    pub read: bool,
    pub write: bool,
    pub connection: Arc<RelayConnection>,
}

/// Normalize a desired relay list into `url -> (read, write)`,
/// last-wins on duplicate keys. Unusable URLs are discarded.
pub(crate) fn desired_pool(configs: &[RelayConfig]) -> IndexMap<String, (bool, bool)> {
    let mut desired = IndexMap::with_capacity(configs.len());
    for config in configs {
        let url = normalize_relay_url(&config.url);
        if url.is_empty() {
            tracing::debug!(url = %config.url, "discarding unusable relay url");
            continue;
        }
        // Last wins, but the first appearance keeps its position.
        desired.insert(url, (config.read, config.write));
    }
    desired
}

/// Readable-set difference between two pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolDiff {
    pub dropped: Vec<String>,
    pub added: Vec<String>,
}

/// Diff two readable URL lists, preserving input order.
pub(crate) fn diff_readable(prev: &[String], next: &[String]) -> PoolDiff {
    let prev_set: HashSet<&str> = prev.iter().map(String::as_str).collect();
    let next_set: HashSet<&str> = next.iter().map(String::as_str).collect();
    PoolDiff {
        dropped: prev.iter().filter(|u| !next_set.contains(u.as_str())).cloned().collect(),
        added: next.iter().filter(|u| !prev_set.contains(u.as_str())).cloned().collect(),
    }
}

/// The relay record map. Callers hold the client's pool lock across
/// every method; nothing here blocks.
pub(crate) struct Pool {
    relays: IndexMap<String, RelayRecord>,
}

impl Pool {
    pub fn new() -> Self {
        Self { relays: IndexMap::new() }
    }

    pub fn get(&self, url: &str) -> Option<&RelayRecord> {
        self.relays.get(url)
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &RelayRecord)> {
        self.relays.iter()
    }

    pub fn readable_urls(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|(_, r)| r.read)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Current desired-state view, usable as the base for single-element
    /// `add`/`remove` applications of `switch`.
    pub fn configs(&self) -> Vec<RelayConfig> {
        self.relays
            .iter()
            .map(|(url, r)| RelayConfig { url: url.clone(), read: r.read, write: r.write })
            .collect()
    }

    pub fn statuses(&self) -> Vec<RelayStatus> {
        self.relays
            .iter()
            .map(|(url, r)| RelayStatus {
                url: url.clone(),
                read: r.read,
                write: r.write,
                state: r.connection.state(),
            })
            .collect()
    }

    /// Reconcile toward `configs`.
    ///
    /// `rehydrate` is the Active-REQ registry snapshot replayed to every
    /// relay added to the readable set. Drop-side CLOSEs are emitted
    /// before add-side REQs, per the pool ordering contract.
    pub fn switch(
        &mut self,
        configs: &[RelayConfig],
        client_config: &ClientConfig,
        hub: &Arc<Hub>,
        shutdown: &CancellationToken,
        rehydrate: &[ClientMessage],
    ) {
        let next = desired_pool(configs);
        let prev_readable = self.readable_urls();
        let next_readable: Vec<String> = next
            .iter()
            .filter(|(_, (read, _))| *read)
            .map(|(url, _)| url.clone())
            .collect();
        let diff = diff_readable(&prev_readable, &next_readable);

        for url in &diff.dropped {
            if let Some(record) = self.relays.get(url) {
                for sub_id in record.connection.active_subs() {
                    record.connection.close_sub(&sub_id);
                }
                record.connection.stop();
            }
        }

        let mut relays = IndexMap::with_capacity(next.len());
        for (url, (read, write)) in next {
            let connection = match self.relays.shift_remove(&url) {
                Some(existing) => existing.connection,
                None => Arc::new(RelayConnection::new(
                    url.clone(),
                    client_config.clone(),
                    Arc::clone(hub),
                    shutdown.clone(),
                )),
            };
            relays.insert(url, RelayRecord { read, write, connection });
        }
        for (url, leftover) in self.relays.drain(..) {
            tracing::debug!(relay = %url, "disposing relay removed from pool");
            leftover.connection.dispose();
        }
        self.relays = relays;

        for url in &diff.added {
            if let Some(record) = self.relays.get(url) {
                record.connection.start();
                for req in rehydrate {
                    record.connection.send(req);
                }
            }
        }
    }

    /// Dispose every member and empty the map.
    pub fn dispose(&mut self) {
        for (_, record) in self.relays.drain(..) {
            record.connection.dispose();
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
