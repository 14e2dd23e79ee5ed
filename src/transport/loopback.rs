//! In-memory transport
//!
//! Every node registered on a [`LoopbackHub`] gets a [`LoopbackSender`] and an
//! inbox receiver. Messages travel over mpsc channels, so per-sender ordering
//! matches TCP. A suspended node can neither send nor be reached.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Inbound, PeerSender};
use crate::error::{Result, TokenMeshError};
use crate::node::{Message, NodeId};
use crate::transport_error;

const INBOX_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Endpoint {
    inbox: mpsc::Sender<Inbound>,
    active: Arc<AtomicBool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoopbackHub {
    endpoints: Arc<DashMap<NodeId, Endpoint>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node_id` and return its sender and inbox.
    pub fn register(
        &self,
        node_id: NodeId,
        cluster_size: usize,
    ) -> (LoopbackSender, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let active = Arc::new(AtomicBool::new(true));
        self.endpoints.insert(
            node_id,
            Endpoint {
                inbox: tx,
                active: active.clone(),
            },
        );
        let sender = LoopbackSender {
            node_id,
            cluster_size,
            active,
            hub: self.clone(),
        };
        (sender, rx)
    }

    fn endpoint(&self, node_id: NodeId) -> Option<Endpoint> {
        self.endpoints.get(&node_id).map(|entry| entry.value().clone())
    }
}

#[derive(Clone, Debug)]
pub struct LoopbackSender {
    node_id: NodeId,
    cluster_size: usize,
    active: Arc<AtomicBool>,
    hub: LoopbackHub,
}

#[async_trait]
impl PeerSender for LoopbackSender {
    async fn send(&self, target: NodeId, message: &Message) -> Result<()> {
        if !self.active.load(Ordering::Acquire) {
            return Err(transport_error!("Node {} is suspended", self.node_id));
        }
        if target == self.node_id || !target.is_member_of(self.cluster_size) {
            return Err(TokenMeshError::unknown_node(target));
        }
        let endpoint = self
            .hub
            .endpoint(target)
            .ok_or_else(|| transport_error!("Node {} is not connected", target))?;
        if !endpoint.active.load(Ordering::Acquire) {
            return Err(transport_error!("Node {} is unreachable", target));
        }
        endpoint
            .inbox
            .send(Inbound {
                from: self.node_id,
                message: message.clone(),
            })
            .await
            .map_err(|_| transport_error!("Node {} inbox is closed", target))
    }

    async fn broadcast(&self, message: &Message) -> Vec<(NodeId, TokenMeshError)> {
        let mut failures = Vec::new();
        for peer in self.node_id.peers(self.cluster_size) {
            if let Err(e) = self.send(peer, message).await {
                debug!(
                    "[Node<{}>] Broadcast to node {} failed: {}",
                    self.node_id, peer, e
                );
                failures.push((peer, e));
            }
        }
        failures
    }

    async fn suspend(&self) {
        self.active.store(false, Ordering::Release);
    }

    async fn resume(&self) -> Result<()> {
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    async fn shutdown(&self) {
        self.active.store(false, Ordering::Release);
        self.hub.endpoints.remove(&self.node_id);
    }
}
