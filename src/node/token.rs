use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use super::{NodeId, RequestLedger};

/// The circulating token: for each node, the logical time at which it last
/// left the critical section.
///
/// Only the holder writes to it, and only its own slot on exit (see
/// [`TokenRecord::mark_served`]).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Decode, Encode)]
pub struct TokenRecord {
    last_served: Vec<u64>,
}

impl TokenRecord {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            last_served: vec![0; cluster_size],
        }
    }

    pub fn from_vec(last_served: Vec<u64>) -> Self {
        Self { last_served }
    }

    pub fn mark_served(&mut self, node: NodeId, timestamp: u64) {
        if let Some(slot) = self.last_served.get_mut(node.index()) {
            *slot = timestamp;
        }
    }

    pub fn last_served(&self, node: NodeId) -> u64 {
        self.last_served.get(node.index()).copied().unwrap_or(0)
    }

    /// `ledger[node] > token[node]`: the node asked after it was last served.
    pub fn has_outstanding_request(&self, node: NodeId, ledger: &RequestLedger) -> bool {
        node.index() < self.last_served.len() && ledger.get(node) > self.last_served(node)
    }

    /// Treat the node's request at `request_ts` as handled without serving it.
    ///
    /// Used when the token could not be delivered to a node that asked for it.
    pub fn forfeit(&mut self, node: NodeId, request_ts: u64) {
        if let Some(slot) = self.last_served.get_mut(node.index()) {
            *slot = (*slot).max(request_ts);
        }
    }

    /// Element-wise max with another copy of the token.
    pub fn absorb(&mut self, other: &TokenRecord) {
        for (slot, theirs) in self.last_served.iter_mut().zip(other.last_served.iter()) {
            *slot = (*slot).max(*theirs);
        }
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.last_served
    }

    pub fn len(&self) -> usize {
        self.last_served.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_served.is_empty()
    }
}
