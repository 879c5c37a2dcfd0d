//! Buffer for ICE candidates that arrive before the remote description.
//!
//! Candidates are keyed by the partner's transport id and drained in
//! arrival order once that partner's link reports a remote description.
//! Entries are discarded when the session ends or the partner changes.

use crate::types::{IceCandidate, TransportId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Per-partner FIFO queue of early candidates
#[derive(Default)]
pub struct PendingIceQueue {
    entries: Mutex<HashMap<TransportId, VecDeque<IceCandidate>>>,
}

impl PendingIceQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate for a partner
    pub fn enqueue(&self, partner: &TransportId, candidate: IceCandidate) {
        let mut entries = self.entries.lock();
        let queue = entries.entry(partner.clone()).or_default();
        queue.push_back(candidate);
        tracing::debug!(%partner, queued = queue.len(), "ice candidate buffered");
    }

    /// Remove and return every buffered candidate for a partner, in
    /// arrival order.
    #[must_use]
    pub fn drain(&self, partner: &TransportId) -> Vec<IceCandidate> {
        self.entries
            .lock()
            .remove(partner)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Discard the buffer for one partner
    pub fn discard(&self, partner: &TransportId) {
        self.entries.lock().remove(partner);
    }

    /// Discard every buffer
    pub fn discard_all(&self) {
        self.entries.lock().clear();
    }

    /// Buffered candidate count for a partner
    #[must_use]
    pub fn len(&self, partner: &TransportId) -> usize {
        self.entries.lock().get(partner).map_or(0, VecDeque::len)
    }

    /// Whether nothing is buffered for a partner
    #[must_use]
    pub fn is_empty(&self, partner: &TransportId) -> bool {
        self.len(partner) == 0
    }
}
