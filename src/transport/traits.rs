//! Transport traits
//!
//! The coordinator only ever talks to the network through [`PeerSender`], so
//! the TCP messenger and the in-memory loopback are interchangeable.
use async_trait::async_trait;

use crate::error::{Result, TokenMeshError};
use crate::node::{Message, NodeId};

/// Outbound half of a node's connection to the rest of the mesh
#[async_trait]
pub trait PeerSender: Send + Sync {
    /// Deliver one message to one peer. Messages to the same peer arrive in
    /// the order they were sent.
    async fn send(&self, target: NodeId, message: &Message) -> Result<()>;

    /// Send to every peer. Returns the peers that could not be reached;
    /// a failed peer never stops delivery to the rest.
    async fn broadcast(&self, message: &Message) -> Vec<(NodeId, TokenMeshError)>;

    /// Stop accepting and sending traffic; the node becomes unreachable.
    async fn suspend(&self);

    /// Undo [`PeerSender::suspend`].
    async fn resume(&self) -> Result<()>;

    /// Close everything for good.
    async fn shutdown(&self);
}
