use super::NodeId;

/// Highest request timestamp seen from each node.
///
/// Entries only move up through [`RequestLedger::record_request`]; the one
/// exception is the owner's own slot, which is cleared when it leaves the
/// critical section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestLedger {
    requests: Vec<u64>,
}

impl RequestLedger {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            requests: vec![0; cluster_size],
        }
    }

    /// Raise `ledger[sender]` to `timestamp` if it is newer.
    ///
    /// Returns `true` when the entry changed. Duplicate or stale requests,
    /// and senders outside the cluster, return `false`.
    pub fn record_request(&mut self, sender: NodeId, timestamp: u64) -> bool {
        match self.requests.get_mut(sender.index()) {
            Some(entry) if timestamp > *entry => {
                *entry = timestamp;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, node: NodeId) -> u64 {
        self.requests.get(node.index()).copied().unwrap_or(0)
    }

    pub fn clear(&mut self, node: NodeId) {
        if let Some(entry) = self.requests.get_mut(node.index()) {
            *entry = 0;
        }
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_takes_max() {
        let mut ledger = RequestLedger::new(3);
        let node = NodeId::new(1);

        assert!(ledger.record_request(node, 4));
        assert!(!ledger.record_request(node, 2));
        assert_eq!(ledger.get(node), 4);
        assert!(ledger.record_request(node, 9));
        assert_eq!(ledger.get(node), 9);
    }

    #[test]
    fn test_duplicate_request_is_idempotent() {
        let mut ledger = RequestLedger::new(3);
        let node = NodeId::new(2);

        assert!(ledger.record_request(node, 7));
        let snapshot = ledger.clone();
        assert!(!ledger.record_request(node, 7));
        assert_eq!(ledger, snapshot);
    }

    #[test]
    fn test_out_of_range_sender_is_ignored() {
        let mut ledger = RequestLedger::new(2);
        assert!(!ledger.record_request(NodeId::new(5), 3));
        assert_eq!(ledger.get(NodeId::new(5)), 0);
        assert_eq!(ledger.as_slice(), &[0, 0]);
    }

    #[test]
    fn test_clear_own_slot() {
        let mut ledger = RequestLedger::new(2);
        ledger.record_request(NodeId::new(0), 3);
        ledger.clear(NodeId::new(0));
        assert_eq!(ledger.get(NodeId::new(0)), 0);
    }
}
