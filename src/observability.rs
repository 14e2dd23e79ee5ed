//! Observability sinks
//!
//! Nodes report every state transition and every message-driven mutation as a
//! [`StatusUpdate`]. Sinks are injected at node construction; publishing never
//! blocks the coordination path.
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::node::{NodeId, NodeState};

/// One node's externally visible state
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatusUpdate {
    pub node_id: NodeId,
    pub state: NodeState,
    /// The node's request ledger, index = node id
    pub pending_requests: Vec<u64>,
    pub has_token: bool,
    pub clock: u64,
}

/// Consumer of node status updates.
pub trait StateSink: Send + Sync {
    /// Must return promptly; implementations drop or buffer rather than wait.
    fn publish(&self, update: StatusUpdate);
}

/// Discards everything
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl StateSink for NullSink {
    fn publish(&self, _update: StatusUpdate) {}
}

/// Emits updates as structured tracing events
#[derive(Clone, Debug, Default)]
pub struct TracingSink;

impl StateSink for TracingSink {
    fn publish(&self, update: StatusUpdate) {
        debug!(
            node_id = update.node_id.value(),
            state = update.state.label(),
            has_token = update.has_token,
            clock = update.clock,
            pending = ?update.pending_requests,
            "[Node<{}>] status", update.node_id
        );
    }
}

/// Forwards updates on an unbounded channel; updates are dropped once the
/// receiver is gone.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateSink for ChannelSink {
    fn publish(&self, update: StatusUpdate) {
        let _ = self.tx.send(update);
    }
}

/// Publishes to several sinks in order
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn StateSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn StateSink>>) -> Self {
        Self { sinks }
    }

    pub fn with(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl StateSink for FanoutSink {
    fn publish(&self, update: StatusUpdate) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.publish(update.clone());
            }
            last.publish(update);
        }
    }
}

/// Full-system view as served by the status API
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClusterSnapshot {
    pub taken_at: DateTime<Utc>,
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub state: NodeState,
    pub queue: Vec<u64>,
    #[serde(rename = "hasToken")]
    pub has_token: bool,
}

impl ClusterSnapshot {
    /// Ids of nodes that claim to hold the token.
    pub fn token_holders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.has_token)
            .map(|node| node.id)
            .collect()
    }

    pub fn count_in(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|node| node.state == state).count()
    }
}

/// Keeps the latest update per node; the aggregator behind [`ClusterSnapshot`].
#[derive(Clone, Debug, Default)]
pub struct SnapshotBoard {
    latest: Arc<RwLock<BTreeMap<NodeId, StatusUpdate>>>,
}

impl SnapshotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let nodes = match self.latest.read() {
            Ok(latest) => latest
                .values()
                .map(|update| NodeSnapshot {
                    id: update.node_id,
                    state: update.state,
                    queue: update.pending_requests.clone(),
                    has_token: update.has_token,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        ClusterSnapshot {
            taken_at: Utc::now(),
            nodes,
        }
    }

    pub fn get(&self, node_id: NodeId) -> Option<StatusUpdate> {
        self.latest
            .read()
            .ok()
            .and_then(|latest| latest.get(&node_id).cloned())
    }

    /// Log a one-line summary of the current snapshot.
    pub fn log_summary(&self) {
        let snapshot = self.snapshot();
        info!(
            nodes = snapshot.nodes.len(),
            in_cs = snapshot.count_in(NodeState::InCs),
            requesting = snapshot.count_in(NodeState::Requesting),
            failed = snapshot.count_in(NodeState::Failed),
            holders = ?snapshot.token_holders(),
            "Cluster stats"
        );
    }
}

impl StateSink for SnapshotBoard {
    fn publish(&self, update: StatusUpdate) {
        if let Ok(mut latest) = self.latest.write() {
            latest.insert(update.node_id, update);
        }
    }
}
