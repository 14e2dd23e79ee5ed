use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Messenger counters
#[derive(Debug, Default)]
pub struct MessengerStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub send_errors: AtomicU64,
    pub receive_errors: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub reconnects: AtomicU64,
}

impl MessengerStats {
    pub fn freeze(&self) -> FrozenMessengerStats {
        FrozenMessengerStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FrozenMessengerStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
    pub connections_opened: u64,
    pub connections_accepted: u64,
    pub reconnects: u64,
}
