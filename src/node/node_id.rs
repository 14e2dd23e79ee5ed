use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Identity of a node in the mesh. Valid ids are `0..cluster_size`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    PartialEq,
    PartialOrd,
    Ord,
    Eq,
    Hash,
    Decode,
    Encode,
)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Slot of this node in per-node vectors (ledger, token).
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn is_member_of(&self, cluster_size: usize) -> bool {
        self.index() < cluster_size
    }

    /// Every other node id, starting just after `self` and wrapping around.
    ///
    /// This is the fixed hand-off scan order.
    pub fn peers_after(self, cluster_size: usize) -> impl Iterator<Item = NodeId> {
        let start = self.index();
        (1..cluster_size).map(move |offset| NodeId(((start + offset) % cluster_size) as u32))
    }

    /// All node ids except `self`, in ascending order.
    pub fn peers(self, cluster_size: usize) -> impl Iterator<Item = NodeId> {
        (0..cluster_size as u32)
            .map(NodeId)
            .filter(move |id| *id != self)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        NodeId(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
