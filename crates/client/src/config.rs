// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

/// Configuration for a [`NostrClient`](crate::NostrClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Max automatic reconnect attempts per relay connection lifetime
    /// before the connection is declared failed.
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Idle timeout for backward/oneshot subscriptions, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_retry() -> u32 {
    10
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { retry: default_retry(), timeout_ms: default_timeout_ms() }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}
