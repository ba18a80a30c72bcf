//! Correlation registry: which outgoing ids are currently awaiting a reply.
//!
//! The registry only answers "is this id pending?". It never stores
//! payloads; replies travel on the responses stream and are matched by the
//! dispatcher that owns the id.

use std::sync::Arc;

use courier_protocol::CorrelationId;
use dashmap::DashSet;

/// Concurrent set of pending correlation ids, shared by one binding and all
/// of its in-flight requests. Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct CorrelationRegistry {
    pending: Arc<DashSet<CorrelationId>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` pending. Returns `false` if it was already present.
    pub fn add(&self, id: &CorrelationId) -> bool {
        self.pending.insert(id.clone())
    }

    /// Remove `id`. Returns `false` if it was not present; never fails.
    pub fn drop(&self, id: &CorrelationId) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.pending.contains(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Snapshot of the pending ids, in no particular order.
    pub fn snapshot(&self) -> Vec<CorrelationId> {
        self.pending.iter().map(|id| id.key().clone()).collect()
    }
}
