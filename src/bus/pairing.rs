//! Request/response waiter registry.
//!
//! A waiter is keyed by `(remote kind, artifact id)` and completed exactly
//! once by whichever response consumer sees the matching message first.
//! Register, complete, and cancel all touch the same short critical section
//! (a shard lock inside the map); nothing here is held across an await.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::RemoteKind;

#[derive(Clone)]
pub struct WaiterRegistry {
    map: Arc<DashMap<(RemoteKind, String), oneshot::Sender<serde_json::Value>>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self { map: Arc::new(DashMap::new()) }
    }

    /// Registers a waiter, returning the receiver the caller parks on.
    /// Re-registering the same key replaces the old waiter; its receiver
    /// resolves to a cancellation error.
    pub fn register(&self, kind: RemoteKind, artifact_id: &str) -> oneshot::Receiver<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        if self
            .map
            .insert((kind, artifact_id.to_string()), tx)
            .is_some()
        {
            tracing::warn!(artifact_id, %kind, "replaced an existing response waiter");
        }
        rx
    }

    /// Completes and removes a waiter. Returns false when no waiter was
    /// registered (late or duplicate response).
    pub fn complete(&self, kind: RemoteKind, artifact_id: &str, payload: serde_json::Value) -> bool {
        match self.map.remove(&(kind, artifact_id.to_string())) {
            Some((_, tx)) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Removes one waiter without completing it.
    pub fn remove(&self, kind: RemoteKind, artifact_id: &str) {
        self.map.remove(&(kind, artifact_id.to_string()));
    }

    /// Drops every waiter for an artifact, both kinds. Their receivers
    /// resolve to a cancellation error.
    pub fn cancel(&self, artifact_id: &str) {
        for kind in [RemoteKind::Mirror, RemoteKind::Superior] {
            self.map.remove(&(kind, artifact_id.to_string()));
        }
    }

    /// Drops all waiters; used on shutdown.
    pub fn cancel_all(&self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for WaiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
