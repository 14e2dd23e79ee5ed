//! Node-to-node transport
//!
//! [`Messenger`] runs the full TCP mesh; [`LoopbackHub`] wires nodes together
//! in memory. Both implement [`PeerSender`] and deliver inbound messages as
//! [`Inbound`] values on an mpsc channel.
pub mod framing;
pub mod loopback;
pub mod messenger;
pub mod stats;
pub mod traits;

use crate::node::{Message, NodeId};
pub use loopback::{LoopbackHub, LoopbackSender};
pub use messenger::Messenger;
pub use stats::{FrozenMessengerStats, MessengerStats};
pub use traits::PeerSender;

/// A message received from a peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub from: NodeId,
    pub message: Message,
}
