//! A token mesh node
//!
//! All protocol state of a node sits behind one `std::sync::Mutex` around a
//! [`TokenProtocol`]. Three kinds of task share it:
//!
//! - the dispatcher, feeding inbound messages to the engine;
//! - the [`Coordinator`], cycling think -> request -> wait -> work -> exit;
//! - the regeneration watchdog (regenerator node only).
//!
//! The lock is never held across an `.await`: a step runs under the lock,
//! publishes its status updates, and the resulting messages are sent after
//! the lock is released.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub mod clock;
pub mod coordinator;
pub mod failure;
pub mod ledger;
pub mod messages;
pub mod node_id;
pub mod protocol;
pub mod state;
pub mod token;

use crate::concurrency_error;
use crate::error::Result;
use crate::observability::{StateSink, StatusUpdate};
use crate::settings::{NodeSettings, Timing};
use crate::transport::{FrozenMessengerStats, Inbound, Messenger, PeerSender};
pub use clock::LamportClock;
pub use coordinator::Coordinator;
pub use failure::FailureController;
pub use ledger::RequestLedger;
pub use messages::{Handshake, Message};
pub use node_id::NodeId;
pub use protocol::{Effects, Outbound, ProtocolStats, TokenProtocol};
pub use state::{NodeState, NodeStateMachine};
pub use token::TokenRecord;

const INBOX_CAPACITY: usize = 1024;

/// State shared by a node's tasks
pub(crate) struct NodeShared {
    pub(crate) id: NodeId,
    cluster_size: usize,
    protocol: Mutex<TokenProtocol>,
    /// Woken whenever possession, failure or shutdown may have changed
    pub(crate) wakeup: Notify,
    pub(crate) sender: Arc<dyn PeerSender>,
    sink: Arc<dyn StateSink>,
    pub(crate) timing: Timing,
    stopped: AtomicBool,
}

impl NodeShared {
    pub(crate) fn with_protocol<T>(&self, f: impl FnOnce(&mut TokenProtocol) -> T) -> Result<T> {
        let mut protocol = self
            .protocol
            .lock()
            .map_err(|_| concurrency_error!("Node {} protocol lock poisoned", self.id))?;
        Ok(f(&mut protocol))
    }

    /// Run one protocol step. Status updates are published while the lock is
    /// held so that every sink sees a node's updates in order.
    pub(crate) fn step(
        &self,
        f: impl FnOnce(&mut TokenProtocol) -> Result<Effects>,
    ) -> Result<Effects> {
        let effects = self.with_protocol(|protocol| {
            let effects = f(protocol)?;
            for update in &effects.updates {
                self.sink.publish(update.clone());
            }
            Ok::<_, crate::error::TokenMeshError>(effects)
        })??;
        if effects.wake {
            self.wakeup.notify_waiters();
        }
        Ok(effects)
    }

    pub(crate) fn step_optional(
        &self,
        f: impl FnOnce(&mut TokenProtocol) -> Option<Effects>,
    ) -> Result<Option<Effects>> {
        let effects = self.with_protocol(|protocol| {
            let effects = f(protocol);
            if let Some(effects) = &effects {
                for update in &effects.updates {
                    self.sink.publish(update.clone());
                }
            }
            effects
        })?;
        if effects.as_ref().is_some_and(|effects| effects.wake) {
            self.wakeup.notify_waiters();
        }
        Ok(effects)
    }

    /// Put a step's messages on the wire. A token that cannot be delivered
    /// is taken back and handed to the next waiting node instead.
    pub(crate) async fn deliver(&self, effects: Effects) {
        let mut queue: VecDeque<Outbound> = effects.outbound.into();
        while let Some(outbound) = queue.pop_front() {
            match outbound {
                Outbound::Broadcast(message) => {
                    for (peer, e) in self.sender.broadcast(&message).await {
                        debug!(
                            "[Node<{}>] {} not delivered to node {}: {}",
                            self.id,
                            message.kind(),
                            peer,
                            e
                        );
                    }
                }
                Outbound::Send { to, message } => {
                    let Err(e) = self.sender.send(to, &message).await else {
                        continue;
                    };
                    warn!(
                        "[Node<{}>] Could not deliver {} to node {}: {}",
                        self.id,
                        message.kind(),
                        to,
                        e
                    );
                    if let Message::Token { token, .. } = message {
                        match self.step(|p| p.reclaim_token(to, token, Instant::now())) {
                            Ok(reclaimed) => queue.extend(reclaimed.outbound),
                            Err(e) => error!("[Node<{}>] Token reclaim failed: {}", self.id, e),
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wakeup.notify_waiters();
    }
}

/// Feed inbound messages into the engine until shutdown. Sends run in the
/// dispatcher's own task set so a slow peer never blocks the inbox; they are
/// aborted when the dispatcher exits.
async fn dispatch(
    shared: Arc<NodeShared>,
    mut inbox: mpsc::Receiver<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut deliveries = JoinSet::new();
    loop {
        tokio::select! {
            inbound = inbox.recv() => {
                let Some(Inbound { from, message }) = inbound else {
                    debug!("[Node<{}>] Inbox closed, dispatcher exiting", shared.id);
                    break;
                };
                match shared.step(|p| p.handle_message(message, Instant::now())) {
                    Ok(effects) if !effects.outbound.is_empty() => {
                        let shared = shared.clone();
                        deliveries.spawn(async move { shared.deliver(effects).await });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(
                        "[Node<{}>] Rejected message from node {}: {}",
                        shared.id, from, e
                    ),
                }
            }
            Some(_) = deliveries.join_next(), if !deliveries.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    deliveries.abort_all();
    while deliveries.join_next().await.is_some() {}
}

/// Handle to a running node
pub struct Node {
    shared: Arc<NodeShared>,
    failure: FailureController,
    messenger: Option<Arc<Messenger>>,
    shutdown: watch::Sender<bool>,
    tasks: AsyncMutex<JoinSet<()>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.shared.id)
            .field("stopped", &self.shared.is_stopped())
            .finish()
    }
}

impl Node {
    /// Bind the node's TCP listener, connect to its peers and start it.
    pub async fn start(settings: &NodeSettings, sink: Arc<dyn StateSink>) -> Result<Self> {
        let messenger = Messenger::bind(settings).await?;
        Self::start_with_messenger(settings, messenger, sink).await
    }

    pub async fn start_with_messenger(
        settings: &NodeSettings,
        messenger: Messenger,
        sink: Arc<dyn StateSink>,
    ) -> Result<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        messenger.listen(inbox_tx)?;
        let messenger = Arc::new(messenger);
        let unreachable = messenger.connect_all().await;
        if !unreachable.is_empty() {
            warn!(
                "[Node<{}>] Starting without connections to {:?}",
                settings.node_id, unreachable
            );
        }
        let mut node = Self::launch(settings, messenger.clone(), inbox_rx, sink)?;
        node.messenger = Some(messenger);
        Ok(node)
    }

    /// Start a node's tasks on an already wired transport.
    pub fn launch(
        settings: &NodeSettings,
        sender: Arc<dyn PeerSender>,
        inbox: mpsc::Receiver<Inbound>,
        sink: Arc<dyn StateSink>,
    ) -> Result<Self> {
        settings.validate()?;
        let protocol = TokenProtocol::new(
            settings.node_id,
            settings.cluster_size,
            settings.starts_with_token(),
            Instant::now(),
        )?;
        sink.publish(protocol.status());

        let shared = Arc::new(NodeShared {
            id: settings.node_id,
            cluster_size: settings.cluster_size,
            protocol: Mutex::new(protocol),
            wakeup: Notify::new(),
            sender,
            sink,
            timing: settings.timing.clone(),
            stopped: AtomicBool::new(false),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let failure = FailureController::new(shared.clone());

        let mut tasks = JoinSet::new();
        tasks.spawn(dispatch(shared.clone(), inbox, shutdown_rx.clone()));
        tasks.spawn(Coordinator::new(shared.clone()).run());
        if settings.is_regenerator() {
            tasks.spawn(failure.clone().run_watchdog(shutdown_rx));
        }

        info!(
            "[Node<{}>] Started in a cluster of {} (token: {}, regenerator: {})",
            settings.node_id,
            settings.cluster_size,
            settings.starts_with_token(),
            settings.is_regenerator()
        );
        Ok(Self {
            shared,
            failure,
            messenger: None,
            shutdown,
            tasks: AsyncMutex::new(tasks),
        })
    }

    pub fn id(&self) -> NodeId {
        self.shared.id
    }

    pub fn cluster_size(&self) -> usize {
        self.shared.cluster_size
    }

    pub fn status(&self) -> Result<StatusUpdate> {
        self.shared.with_protocol(|p| p.status())
    }

    pub fn state(&self) -> Result<NodeState> {
        self.shared.with_protocol(|p| p.state())
    }

    pub fn has_token(&self) -> Result<bool> {
        self.shared.with_protocol(|p| p.has_token())
    }

    pub fn stats(&self) -> Result<ProtocolStats> {
        self.shared.with_protocol(|p| p.stats().clone())
    }

    /// Counters of the TCP messenger, if this node runs on one.
    pub fn transport_stats(&self) -> Option<FrozenMessengerStats> {
        self.messenger.as_ref().map(|messenger| messenger.stats())
    }

    pub async fn fail(&self) -> Result<()> {
        self.failure.fail().await
    }

    pub async fn recover(&self) -> Result<()> {
        self.failure.recover().await
    }

    /// Stop every task of this node. Tasks that do not finish within the
    /// shutdown grace period are aborted.
    pub async fn stop(&self) {
        self.shared.mark_stopped();
        let _ = self.shutdown.send(true);
        self.shared.sender.shutdown().await;

        let mut tasks = self.tasks.lock().await;
        let grace = self.shared.timing.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "[Node<{}>] Tasks still running after {:?}, aborting",
                self.shared.id, grace
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
        info!("[Node<{}>] Stopped", self.shared.id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shared.mark_stopped();
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::observability::NullSink;
    use crate::settings::{MessengerConfig, MillisRange};
    use crate::transport::LoopbackHub;

    fn mesh_settings(node_id: u32, addrs: &[SocketAddr]) -> NodeSettings {
        let node_id = NodeId::new(node_id);
        NodeSettings {
            node_id,
            cluster_size: addrs.len(),
            initial_holder: NodeId::new(0),
            regenerator: None,
            listen_addr: addrs[node_id.index()],
            peers: node_id
                .peers(addrs.len())
                .map(|peer| (peer, addrs[peer.index()]))
                .collect(),
            timing: Timing::default(),
            messenger: MessengerConfig {
                connect_attempts: 2,
                connect_backoff_initial: Duration::from_millis(10),
                connect_backoff_max: Duration::from_millis(20),
                io_timeout: Duration::from_millis(300),
            },
        }
    }

    fn shared_node(id: u32, cluster_size: usize, sender: Arc<dyn PeerSender>) -> NodeShared {
        let protocol =
            TokenProtocol::new(NodeId::new(id), cluster_size, id == 0, Instant::now()).unwrap();
        NodeShared {
            id: NodeId::new(id),
            cluster_size,
            protocol: Mutex::new(protocol),
            wakeup: Notify::new(),
            sender,
            sink: Arc::new(NullSink),
            timing: Timing::default(),
            stopped: AtomicBool::new(false),
        }
    }

    async fn next_message(inbox: &mut mpsc::Receiver<Inbound>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap()
            .message
    }

    #[tokio::test]
    async fn test_token_for_crashed_tcp_peer_goes_to_next_requester() {
        let mut listeners = Vec::new();
        for _ in 0..3 {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
        }
        let addrs: Vec<SocketAddr> = listeners
            .iter()
            .map(|listener| listener.local_addr().unwrap())
            .collect();
        let mut messengers = Vec::new();
        let mut inboxes = Vec::new();
        for (i, listener) in listeners.into_iter().enumerate() {
            let messenger =
                Messenger::from_listener(&mesh_settings(i as u32, &addrs), listener).unwrap();
            let (tx, rx) = mpsc::channel(16);
            messenger.listen(tx).unwrap();
            messengers.push(Arc::new(messenger));
            inboxes.push(rx);
        }

        // node 0 opens its connections and both peers have accepted them
        let holder = messengers[0].clone();
        assert!(holder.connect_all().await.is_empty());
        let hello = Message::Request {
            sender: NodeId::new(0),
            clock: 0,
        };
        assert!(holder.broadcast(&hello).await.is_empty());
        assert_eq!(next_message(&mut inboxes[1]).await, hello);
        assert_eq!(next_message(&mut inboxes[2]).await, hello);

        let shared = shared_node(0, 3, holder.clone());
        shared
            .step(|p| p.request_critical_section(Instant::now()))
            .unwrap();
        assert_eq!(shared.with_protocol(|p| p.state()).unwrap(), NodeState::InCs);
        for peer in [1, 2] {
            let request = Message::Request {
                sender: NodeId::new(peer),
                clock: 1,
            };
            shared
                .step(|p| p.handle_message(request, Instant::now()))
                .unwrap();
        }

        // node 1 is next in line but crashes before the hand-off
        messengers[1].suspend().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let effects = shared.step(|p| p.exit_critical_section()).unwrap();
        shared.deliver(effects).await;

        match next_message(&mut inboxes[2]).await {
            Message::Token { sender, .. } => assert_eq!(sender, NodeId::new(0)),
            other => panic!("expected the token, got {:?}", other),
        }
        assert!(!shared.with_protocol(|p| p.has_token()).unwrap());
        assert_eq!(
            shared
                .with_protocol(|p| p.stats().tokens_reclaimed)
                .unwrap(),
            1
        );
        assert!(holder.stats().send_errors >= 1);
        assert!(inboxes[1].try_recv().is_err());

        for messenger in &messengers {
            messenger.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_node_requests_again_after_quick_fail_and_recover() {
        let addrs: Vec<SocketAddr> =
            vec!["127.0.0.1:1".parse().unwrap(), "127.0.0.1:2".parse().unwrap()];
        let hub = LoopbackHub::new();
        // node 0 never runs, so node 1 waits for the token forever
        let (_holder, mut holder_inbox) = hub.register(NodeId::new(0), 2);
        let (sender, inbox) = hub.register(NodeId::new(1), 2);

        let mut settings = mesh_settings(1, &addrs);
        settings.timing = Timing {
            think: MillisRange::new(1, 2),
            request_refresh: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(200),
            ..Timing::default()
        };
        let node = Node::launch(&settings, Arc::new(sender), inbox, Arc::new(NullSink)).unwrap();

        let first = next_message(&mut holder_inbox).await;
        assert!(matches!(first, Message::Request { sender, .. } if sender == NodeId::new(1)));
        assert_eq!(node.state().unwrap(), NodeState::Requesting);

        node.fail().await.unwrap();
        node.recover().await.unwrap();

        let again = next_message(&mut holder_inbox).await;
        match (first, again) {
            (Message::Request { clock: before, .. }, Message::Request { sender, clock }) => {
                assert_eq!(sender, NodeId::new(1));
                assert!(clock > before);
            }
            (_, other) => panic!("expected a fresh request, got {:?}", other),
        }
        assert_eq!(node.state().unwrap(), NodeState::Requesting);
        assert_eq!(node.stats().unwrap().requests_sent, 2);

        node.stop().await;
    }
}
