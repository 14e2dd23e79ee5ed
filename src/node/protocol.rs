//! Token protocol engine
//!
//! `TokenProtocol` holds all of a node's coordination state (clock, ledger,
//! token, state machine) and implements every protocol step as a synchronous
//! method. Steps never perform I/O: they return [`Effects`] describing the
//! messages to send and the status updates to publish. The runtime executes
//! them after releasing the node lock.
//!
//! Hand-off order: when the holder gives the token away it scans the other
//! nodes starting just after itself and wrapping (`self+1, self+2, ...`) and
//! picks the first with `ledger[j] > token[j]`.
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{LamportClock, Message, NodeId, NodeState, NodeStateMachine, RequestLedger, TokenRecord};
use crate::error::{Result, TokenMeshError};
use crate::observability::StatusUpdate;
use crate::{config_error, protocol_error};

/// A message the runtime has to put on the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(Message),
    Send { to: NodeId, message: Message },
}

/// Result of one protocol step
#[derive(Debug, Default)]
pub struct Effects {
    pub outbound: Vec<Outbound>,
    pub updates: Vec<StatusUpdate>,
    /// Possession went from false to true during this step
    pub token_acquired: bool,
    /// A task parked on this node (token wait, failure parking) must re-check
    pub wake: bool,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.updates.is_empty() && !self.wake
    }

    /// Token messages this step hands to other nodes.
    pub fn handoffs(&self) -> impl Iterator<Item = (NodeId, &TokenRecord)> {
        self.outbound.iter().filter_map(|outbound| match outbound {
            Outbound::Send {
                to,
                message: Message::Token { token, .. },
            } => Some((*to, token)),
            _ => None,
        })
    }

    /// The request broadcast by this step, if any.
    pub fn request(&self) -> Option<&Message> {
        self.outbound.iter().find_map(|outbound| match outbound {
            Outbound::Broadcast(message @ Message::Request { .. }) => Some(message),
            _ => None,
        })
    }
}

/// Counters kept by the engine
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProtocolStats {
    pub requests_sent: u64,
    pub requests_received: u64,
    pub tokens_sent: u64,
    pub tokens_received: u64,
    pub preemptive_grants: u64,
    pub cs_entries: u64,
    pub tokens_reclaimed: u64,
    pub tokens_lost: u64,
    pub duplicate_tokens_merged: u64,
    pub regenerations: u64,
}

#[derive(Debug)]
pub struct TokenProtocol {
    id: NodeId,
    cluster_size: usize,
    clock: LamportClock,
    ledger: RequestLedger,
    /// `Some` while this node possesses the token
    token: Option<TokenRecord>,
    /// Most recent copy of the token this node has seen
    last_known_token: TokenRecord,
    machine: NodeStateMachine,
    /// Timestamp of the request currently waiting for the token
    pending_request: Option<u64>,
    requested_at: Option<Instant>,
    last_token_activity: Instant,
    /// Bumped by every `fail()`
    failure_epoch: u64,
    stats: ProtocolStats,
}

impl TokenProtocol {
    pub fn new(id: NodeId, cluster_size: usize, holds_token: bool, now: Instant) -> Result<Self> {
        if cluster_size == 0 {
            return Err(config_error!("Cluster must contain at least one node"));
        }
        if !id.is_member_of(cluster_size) {
            return Err(config_error!(
                "Node id {} is outside a cluster of {} nodes",
                id,
                cluster_size
            ));
        }
        let token = TokenRecord::new(cluster_size);
        Ok(Self {
            id,
            cluster_size,
            clock: LamportClock::new(),
            ledger: RequestLedger::new(cluster_size),
            token: holds_token.then(|| token.clone()),
            last_known_token: token,
            machine: NodeStateMachine::new(),
            pending_request: None,
            requested_at: None,
            last_token_activity: now,
            failure_epoch: 0,
            stats: ProtocolStats::default(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Number of failures so far. A caller that sees it change knows the
    /// node crashed in between, even if it has already recovered.
    pub fn failure_epoch(&self) -> u64 {
        self.failure_epoch
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn state(&self) -> NodeState {
        self.machine.current()
    }

    pub fn is_failed(&self) -> bool {
        self.machine.is(NodeState::Failed)
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn clock(&self) -> u64 {
        self.clock.now()
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn token(&self) -> Option<&TokenRecord> {
        self.token.as_ref()
    }

    pub fn last_known_token(&self) -> &TokenRecord {
        &self.last_known_token
    }

    pub fn pending_request(&self) -> Option<u64> {
        self.pending_request
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    pub fn status(&self) -> StatusUpdate {
        StatusUpdate {
            node_id: self.id,
            state: self.state(),
            pending_requests: self.ledger.as_slice().to_vec(),
            has_token: self.has_token(),
            clock: self.clock.now(),
        }
    }

    /// Whether the token holder should hand the token to `node` right now.
    pub fn has_outstanding_request(&self, node: NodeId) -> bool {
        self.token
            .as_ref()
            .is_some_and(|token| token.has_outstanding_request(node, &self.ledger))
    }

    /// Start a request for the critical section.
    ///
    /// Ticks the clock, records the request in the node's own ledger slot and
    /// broadcasts it. A node that already holds the token passes straight
    /// through REQUESTING into IN_CS without sending anything.
    pub fn request_critical_section(&mut self, now: Instant) -> Result<Effects> {
        let mut effects = Effects::default();
        self.transition(NodeState::Requesting, &mut effects)?;

        let timestamp = self.clock.tick();
        self.ledger.record_request(self.id, timestamp);
        self.pending_request = Some(timestamp);
        self.requested_at = Some(now);
        effects.updates.push(self.status());

        if self.has_token() {
            debug!(
                "[Node<{}>] Already holding the token, entering critical section (clock {})",
                self.id, timestamp
            );
            self.enter(&mut effects)?;
        } else {
            debug!(
                "[Node<{}>] Requesting critical section at clock {}",
                self.id, timestamp
            );
            self.stats.requests_sent += 1;
            if self.cluster_size > 1 {
                effects.outbound.push(Outbound::Broadcast(Message::Request {
                    sender: self.id,
                    clock: timestamp,
                }));
            }
        }
        Ok(effects)
    }

    /// Re-issue the pending request while still waiting for the token.
    ///
    /// The request gets a fresh timestamp, so peers whose ledger entry was
    /// forfeited after an undeliverable hand-off see it as outstanding again.
    pub fn refresh_request(&mut self) -> Option<Effects> {
        if !self.machine.is(NodeState::Requesting) || self.has_token() || self.cluster_size < 2 {
            return None;
        }
        self.pending_request?;
        let timestamp = self.clock.tick();
        self.ledger.record_request(self.id, timestamp);
        self.pending_request = Some(timestamp);
        self.stats.requests_sent += 1;
        debug!(
            "[Node<{}>] Still waiting for the token, re-requesting at clock {}",
            self.id, timestamp
        );

        let mut effects = Effects::default();
        effects.outbound.push(Outbound::Broadcast(Message::Request {
            sender: self.id,
            clock: timestamp,
        }));
        effects.updates.push(self.status());
        Some(effects)
    }

    /// REQUESTING -> IN_CS once the token is held. No-op when already inside.
    pub fn enter_critical_section(&mut self) -> Result<Effects> {
        let mut effects = Effects::default();
        if self.machine.is(NodeState::InCs) {
            return Ok(effects);
        }
        if !self.has_token() {
            return Err(protocol_error!(
                "Node {} cannot enter the critical section without the token",
                self.id
            ));
        }
        self.enter(&mut effects)?;
        Ok(effects)
    }

    /// Leave the critical section and pass the token on.
    ///
    /// Records the exit time in the token, clears the node's own ledger slot,
    /// moves to IDLE and hands the token to the first peer (in scan order)
    /// with an outstanding request. Keeps the token when nobody is waiting.
    pub fn exit_critical_section(&mut self) -> Result<Effects> {
        let mut effects = Effects::default();
        if !self.machine.is(NodeState::InCs) {
            return Err(TokenMeshError::InvalidTransition {
                from: self.state(),
                to: NodeState::Idle,
            });
        }
        let exit_clock = self.clock.now();
        match self.token.as_mut() {
            Some(token) => token.mark_served(self.id, exit_clock),
            None => {
                return Err(protocol_error!(
                    "Node {} is in the critical section without the token",
                    self.id
                ))
            }
        }
        self.ledger.clear(self.id);
        self.pending_request = None;
        self.requested_at = None;
        self.transition(NodeState::Idle, &mut effects)?;
        debug!(
            "[Node<{}>] Left critical section at clock {}",
            self.id, exit_clock
        );

        self.hand_off(&mut effects);
        effects.updates.push(self.status());
        Ok(effects)
    }

    /// Receive handler for one inbound message.
    pub fn handle_message(&mut self, message: Message, now: Instant) -> Result<Effects> {
        let mut effects = Effects::default();
        if self.is_failed() {
            if let Message::Token { sender, .. } = &message {
                self.stats.tokens_lost += 1;
                warn!(
                    "[Node<{}>] Discarding token from node {} received while failed",
                    self.id, sender
                );
            }
            return Ok(effects);
        }
        self.validate(&message)?;

        match message {
            Message::Request { sender, clock } => {
                self.clock.observe(clock);
                self.stats.requests_received += 1;
                if self.ledger.record_request(sender, clock) {
                    debug!(
                        "[Node<{}>] Recorded request from node {} at clock {}",
                        self.id, sender, clock
                    );
                }
                if self.machine.is(NodeState::Idle) && self.has_outstanding_request(sender) {
                    self.stats.preemptive_grants += 1;
                    self.send_token(sender, &mut effects);
                }
            }
            Message::Token {
                sender,
                clock,
                token,
            } => {
                self.clock.observe(clock);
                self.last_token_activity = now;
                self.stats.tokens_received += 1;
                debug!(
                    "[Node<{}>] Received token from node {} (clock {})",
                    self.id, sender, clock
                );
                self.accept_token(token, &mut effects);
            }
        }
        effects.updates.push(self.status());
        Ok(effects)
    }

    /// Take back a token that could not be delivered to `target`.
    ///
    /// The target's request is forfeited so that the next scan skips it.
    pub fn reclaim_token(
        &mut self,
        target: NodeId,
        mut token: TokenRecord,
        now: Instant,
    ) -> Result<Effects> {
        let mut effects = Effects::default();
        if self.is_failed() {
            self.stats.tokens_lost += 1;
            warn!(
                "[Node<{}>] Token for node {} bounced while failed; it is lost",
                self.id, target
            );
            return Ok(effects);
        }
        token.forfeit(target, self.ledger.get(target));
        self.last_token_activity = now;
        self.stats.tokens_reclaimed += 1;
        info!(
            "[Node<{}>] Reclaimed undeliverable token for node {}",
            self.id, target
        );
        self.accept_token(token, &mut effects);
        effects.updates.push(self.status());
        Ok(effects)
    }

    /// Crash this node: drop the token if held and abandon the pending request.
    pub fn fail(&mut self) -> Result<Effects> {
        let mut effects = Effects::default();
        self.transition(NodeState::Failed, &mut effects)?;
        self.failure_epoch += 1;
        if let Some(token) = self.token.take() {
            self.last_known_token = token;
            self.stats.tokens_lost += 1;
            warn!("[Node<{}>] Failed while holding the token", self.id);
        }
        self.pending_request = None;
        self.requested_at = None;
        effects.wake = true;
        Ok(effects)
    }

    /// FAILED -> IDLE.
    pub fn recover(&mut self, now: Instant) -> Result<Effects> {
        let mut effects = Effects::default();
        self.transition(NodeState::Idle, &mut effects)?;
        self.ledger.clear(self.id);
        self.last_token_activity = now;
        effects.wake = true;
        Ok(effects)
    }

    /// Token regeneration heuristic.
    ///
    /// Fabricates a token from the last known copy when this node has been
    /// REQUESTING without the token for at least `timeout` and has seen no
    /// token traffic for as long. Returns `None` when the conditions do not
    /// hold. This can duplicate the token if the real one is merely slow.
    pub fn try_regenerate(&mut self, now: Instant, timeout: Duration) -> Option<Effects> {
        if self.is_failed() || self.has_token() || !self.machine.is(NodeState::Requesting) {
            return None;
        }
        let waited = self
            .requested_at
            .map(|requested_at| now.saturating_duration_since(requested_at))?;
        let quiet = now.saturating_duration_since(self.last_token_activity);
        if waited < timeout || quiet < timeout {
            return None;
        }

        let mut token = self.last_known_token.clone();
        if token.len() != self.cluster_size {
            token = TokenRecord::new(self.cluster_size);
        }
        self.stats.regenerations += 1;
        self.last_token_activity = now;
        warn!(
            "[Node<{}>] No token seen for {:?}; regenerating it",
            self.id, quiet
        );

        let mut effects = Effects::default();
        self.accept_token(token, &mut effects);
        effects.updates.push(self.status());
        Some(effects)
    }

    fn validate(&self, message: &Message) -> Result<()> {
        let sender = message.sender();
        if !sender.is_member_of(self.cluster_size) || sender == self.id {
            return Err(protocol_error!(
                "Node {} received {} from invalid sender {}",
                self.id,
                message.kind(),
                sender
            ));
        }
        if let Message::Token { token, .. } = message {
            if token.len() != self.cluster_size {
                return Err(protocol_error!(
                    "Token from node {} has {} slots, expected {}",
                    sender,
                    token.len(),
                    self.cluster_size
                ));
            }
        }
        Ok(())
    }

    fn transition(&mut self, next: NodeState, effects: &mut Effects) -> Result<()> {
        let previous = self.machine.transition(next)?;
        debug!("[Node<{}>] {} -> {}", self.id, previous, next);
        effects.updates.push(self.status());
        Ok(())
    }

    fn enter(&mut self, effects: &mut Effects) -> Result<()> {
        self.transition(NodeState::InCs, effects)?;
        self.stats.cs_entries += 1;
        info!(
            "[Node<{}>] Entered critical section (clock {})",
            self.id,
            self.clock.now()
        );
        Ok(())
    }

    /// Possession becomes true. A second token is folded into the first.
    fn accept_token(&mut self, incoming: TokenRecord, effects: &mut Effects) {
        match self.token.as_mut() {
            Some(current) => {
                current.absorb(&incoming);
                self.stats.duplicate_tokens_merged += 1;
                warn!(
                    "[Node<{}>] Received a second token while holding one; merged",
                    self.id
                );
            }
            None => {
                self.last_known_token = incoming.clone();
                self.token = Some(incoming);
                effects.token_acquired = true;
                effects.wake = true;
            }
        }
        // Nobody here is waiting for it: pass it on if someone else is.
        if self.machine.is(NodeState::Idle) {
            self.hand_off(effects);
        }
    }

    /// Scan peers after self, wrapping, and send the token to the first one
    /// with an outstanding request.
    fn hand_off(&mut self, effects: &mut Effects) {
        let next = self
            .id
            .peers_after(self.cluster_size)
            .find(|peer| self.has_outstanding_request(*peer));
        match next {
            Some(peer) => self.send_token(peer, effects),
            None => debug!("[Node<{}>] No outstanding requests, keeping token", self.id),
        }
    }

    /// Clear possession and queue the token message for `to`.
    fn send_token(&mut self, to: NodeId, effects: &mut Effects) {
        let Some(token) = self.token.take() else {
            return;
        };
        self.last_known_token = token.clone();
        self.stats.tokens_sent += 1;
        info!(
            "[Node<{}>] Handing token to node {} (request {} > served {})",
            self.id,
            to,
            self.ledger.get(to),
            token.last_served(to)
        );
        effects.outbound.push(Outbound::Send {
            to,
            message: Message::Token {
                sender: self.id,
                clock: self.clock.now(),
                token,
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, n: usize, holds_token: bool) -> TokenProtocol {
        TokenProtocol::new(NodeId::new(id), n, holds_token, Instant::now()).unwrap()
    }

    fn request(sender: u32, clock: u64) -> Message {
        Message::Request {
            sender: NodeId::new(sender),
            clock,
        }
    }

    #[test]
    fn test_invalid_construction() {
        assert!(TokenProtocol::new(NodeId::new(0), 0, true, Instant::now()).is_err());
        assert!(TokenProtocol::new(NodeId::new(3), 3, false, Instant::now()).is_err());
    }

    #[test]
    fn test_request_broadcasts_when_not_holding() {
        let mut p = node(1, 3, false);
        let effects = p.request_critical_section(Instant::now()).unwrap();

        assert_eq!(p.state(), NodeState::Requesting);
        assert_eq!(p.clock(), 1);
        assert_eq!(p.ledger().get(NodeId::new(1)), 1);
        assert_eq!(effects.request(), Some(&request(1, 1)));

        let refreshed = p.refresh_request().unwrap();
        assert_eq!(refreshed.request(), Some(&request(1, 2)));
        assert_eq!(p.pending_request(), Some(2));
        assert_eq!(p.ledger().get(NodeId::new(1)), 2);
    }

    #[test]
    fn test_holder_passes_through_requesting() {
        let mut p = node(0, 3, true);
        let effects = p.request_critical_section(Instant::now()).unwrap();

        assert_eq!(p.state(), NodeState::InCs);
        assert!(effects.outbound.is_empty());
        let states: Vec<NodeState> = effects.updates.iter().map(|u| u.state).collect();
        assert!(states.contains(&NodeState::Requesting));
        assert_eq!(states.last(), Some(&NodeState::InCs));
        assert_eq!(p.stats().cs_entries, 1);
    }

    #[test]
    fn test_request_while_in_cs_is_rejected() {
        let mut p = node(0, 2, true);
        p.request_critical_section(Instant::now()).unwrap();
        assert!(p.request_critical_section(Instant::now()).is_err());
        assert_eq!(p.state(), NodeState::InCs);
    }

    #[test]
    fn test_enter_requires_token() {
        let mut p = node(1, 2, false);
        p.request_critical_section(Instant::now()).unwrap();
        assert!(p.enter_critical_section().is_err());
        assert_eq!(p.state(), NodeState::Requesting);
    }

    #[test]
    fn test_exit_keeps_token_without_requests() {
        let mut p = node(0, 3, true);
        p.request_critical_section(Instant::now()).unwrap();
        let effects = p.exit_critical_section().unwrap();

        assert!(effects.outbound.is_empty());
        assert!(p.has_token());
        assert_eq!(p.state(), NodeState::Idle);
        assert_eq!(p.ledger().get(NodeId::new(0)), 0);
        assert_eq!(p.token().unwrap().last_served(NodeId::new(0)), p.clock());
    }

    #[test]
    fn test_token_message_wakes_requester() {
        let mut p = node(2, 3, false);
        p.request_critical_section(Instant::now()).unwrap();

        let effects = p
            .handle_message(
                Message::Token {
                    sender: NodeId::new(0),
                    clock: 5,
                    token: TokenRecord::new(3),
                },
                Instant::now(),
            )
            .unwrap();

        assert!(effects.token_acquired);
        assert!(p.has_token());
        assert_eq!(p.clock(), 6);
        p.enter_critical_section().unwrap();
        assert_eq!(p.state(), NodeState::InCs);
    }

    #[test]
    fn test_invalid_sender_is_rejected_without_mutation() {
        let mut p = node(0, 3, true);
        assert!(p.handle_message(request(7, 3), Instant::now()).is_err());
        assert!(p.handle_message(request(0, 3), Instant::now()).is_err());
        assert_eq!(p.clock(), 0);

        let short_token = Message::Token {
            sender: NodeId::new(1),
            clock: 2,
            token: TokenRecord::new(2),
        };
        assert!(p.handle_message(short_token, Instant::now()).is_err());
        assert_eq!(p.ledger().as_slice(), &[0, 0, 0]);
    }

    #[test]
    fn test_holder_in_cs_defers_grant() {
        let mut p = node(0, 3, true);
        p.request_critical_section(Instant::now()).unwrap();

        let effects = p.handle_message(request(1, 1), Instant::now()).unwrap();
        assert!(effects.handoffs().next().is_none());
        assert!(p.has_token());

        let effects = p.exit_critical_section().unwrap();
        let handoffs: Vec<NodeId> = effects.handoffs().map(|(to, _)| to).collect();
        assert_eq!(handoffs, vec![NodeId::new(1)]);
        assert!(!p.has_token());
    }

    #[test]
    fn test_failed_node_ignores_messages_and_loses_token() {
        let mut p = node(0, 3, true);
        let effects = p.fail().unwrap();
        assert!(effects.wake);
        assert!(!p.has_token());

        let effects = p.handle_message(request(1, 4), Instant::now()).unwrap();
        assert!(effects.is_empty());
        assert_eq!(p.ledger().get(NodeId::new(1)), 0);

        let token = Message::Token {
            sender: NodeId::new(2),
            clock: 9,
            token: TokenRecord::new(3),
        };
        p.handle_message(token, Instant::now()).unwrap();
        assert!(!p.has_token());
        assert_eq!(p.stats().tokens_lost, 2);

        p.recover(Instant::now()).unwrap();
        assert_eq!(p.state(), NodeState::Idle);
        assert!(p.fail().is_ok());
        assert!(p.fail().is_err());
    }

    #[test]
    fn test_idle_receiver_passes_token_on() {
        // Node 1 gets a token it never asked for while node 2 is waiting.
        let mut p = node(1, 3, false);
        p.handle_message(request(2, 4), Instant::now()).unwrap();

        let effects = p
            .handle_message(
                Message::Token {
                    sender: NodeId::new(0),
                    clock: 6,
                    token: TokenRecord::new(3),
                },
                Instant::now(),
            )
            .unwrap();
        let handoffs: Vec<NodeId> = effects.handoffs().map(|(to, _)| to).collect();
        assert_eq!(handoffs, vec![NodeId::new(2)]);
        assert!(!p.has_token());
    }

    #[test]
    fn test_regeneration_conditions() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut p = TokenProtocol::new(NodeId::new(0), 3, false, start).unwrap();

        // not requesting
        assert!(p.try_regenerate(start + timeout * 2, timeout).is_none());

        p.request_critical_section(start).unwrap();
        assert!(p
            .try_regenerate(start + Duration::from_secs(5), timeout)
            .is_none());

        let effects = p.try_regenerate(start + timeout, timeout).unwrap();
        assert!(effects.token_acquired);
        assert!(p.has_token());
        assert_eq!(p.stats().regenerations, 1);

        // already holding
        assert!(p.try_regenerate(start + timeout * 3, timeout).is_none());
    }

    #[test]
    fn test_regenerated_token_keeps_service_history() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut p = TokenProtocol::new(NodeId::new(1), 3, false, start).unwrap();
        p.request_critical_section(start).unwrap();
        p.handle_message(
            Message::Token {
                sender: NodeId::new(0),
                clock: 5,
                token: TokenRecord::from_vec(vec![5, 0, 0]),
            },
            start,
        )
        .unwrap();
        p.enter_critical_section().unwrap();
        p.exit_critical_section().unwrap();
        let served = p.token().unwrap().last_served(NodeId::new(1));

        p.fail().unwrap();
        p.recover(start).unwrap();
        p.request_critical_section(start).unwrap();
        assert!(p.refresh_request().is_some());

        let effects = p.try_regenerate(start + timeout, timeout).unwrap();
        assert!(effects.handoffs().next().is_none());
        let token = p.token().unwrap();
        assert_eq!(token.last_served(NodeId::new(0)), 5);
        assert_eq!(token.last_served(NodeId::new(1)), served);
    }

    #[test]
    fn test_reclaimed_token_skips_unreachable_target() {
        let mut p = node(0, 3, true);
        let effects = p.handle_message(request(1, 2), Instant::now()).unwrap();
        // Idle holder grants node 1 straight away
        let (to, token) = effects.handoffs().next().unwrap();
        assert_eq!(to, NodeId::new(1));
        let token = token.clone();
        assert!(!p.has_token());
        p.handle_message(request(2, 3), Instant::now()).unwrap();

        let effects = p
            .reclaim_token(NodeId::new(1), token, Instant::now())
            .unwrap();
        let handoffs: Vec<NodeId> = effects.handoffs().map(|(to, _)| to).collect();
        assert_eq!(handoffs, vec![NodeId::new(2)]);
        assert_eq!(p.stats().tokens_reclaimed, 1);
    }

    #[test]
    fn test_failure_epoch_survives_recovery() {
        let mut p = node(1, 3, false);
        p.request_critical_section(Instant::now()).unwrap();
        let epoch = p.failure_epoch();

        p.fail().unwrap();
        p.recover(Instant::now()).unwrap();
        assert_eq!(p.state(), NodeState::Idle);
        assert_eq!(p.failure_epoch(), epoch + 1);
        assert_eq!(p.pending_request(), None);
        assert!(p.refresh_request().is_none());

        // the next cycle starts over with a fresh request
        let effects = p.request_critical_section(Instant::now()).unwrap();
        assert!(effects.request().is_some());
        assert_eq!(p.failure_epoch(), epoch + 1);
    }
}
