// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Active-REQ registry.
//!
//! Holds the last-sent REQ frame per *forward* subscription so relays
//! added to the pool mid-subscription can be brought up to date. The
//! per-relay active-subscription sets are a different cache with a
//! different invariant (duplicate-REQ suppression for backward
//! subscriptions); both are kept.
//!
//! Lock order: never acquire the pool lock while holding this one. The
//! engine updates the registry before touching the pool; `switch` takes
//! pool first, then registry.

use std::collections::HashMap;

use crate::wire::ClientMessage;

pub(crate) struct ReqRegistry {
    reqs: HashMap<String, ClientMessage>,
}

impl ReqRegistry {
    pub fn new() -> Self {
        Self { reqs: HashMap::new() }
    }

    /// Record the latest REQ for a forward subscription, replacing any
    /// previous frame under the same id.
    pub fn record(&mut self, sub_id: &str, req: ClientMessage) {
        self.reqs.insert(sub_id.to_owned(), req);
    }

    pub fn remove(&mut self, sub_id: &str) {
        self.reqs.remove(sub_id);
    }

    /// Snapshot of every registered frame, for pool-add rehydration.
    pub fn frames(&self) -> Vec<ClientMessage> {
        self.reqs.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.reqs.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.reqs.len()
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
