//! Simulated network for driving protocol engines without sockets
#![allow(dead_code)]

use std::time::{Duration, Instant};

use tokenmesh::node::{Effects, Message, NodeId, NodeState, Outbound, TokenProtocol};

#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
}

/// N engines and the messages travelling between them
pub struct SimNetwork {
    pub nodes: Vec<TokenProtocol>,
    pub in_flight: Vec<Envelope>,
    pub now: Instant,
    pub handoffs: usize,
}

impl SimNetwork {
    /// Node 0 starts with the token.
    pub fn new(cluster_size: usize) -> Self {
        let now = Instant::now();
        let nodes = (0..cluster_size as u32)
            .map(|id| TokenProtocol::new(NodeId::new(id), cluster_size, id == 0, now).unwrap())
            .collect();
        Self {
            nodes,
            in_flight: Vec::new(),
            now,
            handoffs: 0,
        }
    }

    pub fn node(&self, id: u32) -> &TokenProtocol {
        &self.nodes[id as usize]
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Queue the messages produced by `from`, checking every token hand-off
    /// against the sender's ledger.
    pub fn apply(&mut self, from: NodeId, effects: Effects) {
        let sender = &self.nodes[from.index()];
        for (to, token) in effects.handoffs() {
            assert!(
                sender.ledger().get(to) > token.last_served(to),
                "node {} handed the token to {} without an outstanding request",
                from,
                to
            );
        }
        for outbound in effects.outbound {
            match outbound {
                Outbound::Broadcast(message) => {
                    for to in from.peers(self.nodes.len()) {
                        self.in_flight.push(Envelope {
                            from,
                            to,
                            message: message.clone(),
                        });
                    }
                }
                Outbound::Send { to, message } => {
                    if matches!(message, Message::Token { .. }) {
                        self.handoffs += 1;
                    }
                    self.in_flight.push(Envelope { from, to, message });
                }
            }
        }
    }

    pub fn request(&mut self, id: u32) {
        let now = self.now;
        let effects = self.nodes[id as usize]
            .request_critical_section(now)
            .unwrap();
        self.apply(NodeId::new(id), effects);
    }

    pub fn refresh(&mut self, id: u32) {
        if let Some(effects) = self.nodes[id as usize].refresh_request() {
            self.apply(NodeId::new(id), effects);
        }
    }

    /// Enter if the node is requesting and holds the token.
    pub fn try_enter(&mut self, id: u32) -> bool {
        let node = &mut self.nodes[id as usize];
        if node.state() == NodeState::Requesting && node.has_token() {
            node.enter_critical_section().unwrap();
            true
        } else {
            node.state() == NodeState::InCs
        }
    }

    pub fn exit(&mut self, id: u32) {
        let effects = self.nodes[id as usize].exit_critical_section().unwrap();
        self.apply(NodeId::new(id), effects);
    }

    pub fn fail(&mut self, id: u32) {
        self.nodes[id as usize].fail().unwrap();
    }

    pub fn recover(&mut self, id: u32) {
        let now = self.now;
        self.nodes[id as usize].recover(now).unwrap();
    }

    /// Deliver the envelope at `index`. Tokens addressed to a failed node
    /// bounce back to their sender, as a failed TCP send would.
    pub fn deliver(&mut self, index: usize) {
        let Envelope { from, to, message } = self.in_flight.remove(index);
        let now = self.now;

        if self.nodes[to.index()].is_failed() {
            if let Message::Token { token, .. } = message {
                let effects = self.nodes[from.index()]
                    .reclaim_token(to, token, now)
                    .unwrap();
                self.apply(from, effects);
            }
            return;
        }

        let before = self.nodes[to.index()].clock();
        let remote = message.clock();
        let effects = self.nodes[to.index()].handle_message(message, now).unwrap();
        let after = self.nodes[to.index()].clock();
        assert!(
            after > before.max(remote),
            "clock of node {} went from {} to {} observing {}",
            to,
            before,
            after,
            remote
        );
        self.apply(to, effects);
    }

    pub fn deliver_all(&mut self) {
        while !self.in_flight.is_empty() {
            self.deliver(0);
        }
    }

    pub fn holders(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.has_token())
            .map(|node| node.id())
            .collect()
    }

    pub fn in_cs(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.state() == NodeState::InCs)
            .map(|node| node.id())
            .collect()
    }

    pub fn tokens_in_flight(&self) -> usize {
        self.in_flight
            .iter()
            .filter(|envelope| matches!(envelope.message, Message::Token { .. }))
            .count()
    }

    /// At most one node inside, at most one token anywhere.
    pub fn check_safety(&self) {
        assert!(self.in_cs().len() <= 1, "several nodes in CS: {:?}", self.in_cs());
        assert!(
            self.holders().len() + self.tokens_in_flight() <= 1,
            "token duplicated: holders {:?}, {} in flight",
            self.holders(),
            self.tokens_in_flight()
        );
        for node in &self.nodes {
            if node.state() == NodeState::InCs {
                assert!(node.has_token(), "node {} in CS without token", node.id());
            }
        }
    }
}
