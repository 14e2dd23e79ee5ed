//! TCP messenger
//!
//! Full mesh of persistent TCP connections. Each node dials one outbound
//! connection per peer for its own sends and accepts one inbound connection
//! from every peer. The first frame on a connection is a [`Handshake`];
//! every frame after that is a [`Message`].
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::framing::{read_frame, write_frame};
use super::stats::{FrozenMessengerStats, MessengerStats};
use super::{Inbound, PeerSender};
use crate::error::{Result, TokenMeshError};
use crate::node::{Handshake, Message, NodeId};
use crate::settings::{MessengerConfig, NodeSettings};
use crate::{concurrency_error, transport_error};

/// Outbound connection to one peer
#[derive(Debug)]
struct PeerLink {
    local_id: NodeId,
    target: NodeId,
    addr: SocketAddr,
    handshake: Bytes,
    config: MessengerConfig,
    stream: AsyncMutex<Option<TcpStream>>,
    stats: Arc<MessengerStats>,
}

impl PeerLink {
    /// Send one frame, reconnecting and retrying once on failure.
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut stream = self.stream.lock().await;
        if let Err(e) = self.try_send(&mut stream, payload).await {
            debug!(
                "[Node<{}>] Send to node {} failed ({}), reconnecting",
                self.local_id, self.target, e
            );
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.try_send(&mut stream, payload).await {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn try_send(&self, stream: &mut Option<TcpStream>, payload: &[u8]) -> Result<()> {
        if stream.as_ref().is_some_and(peer_hung_up) {
            debug!(
                "[Node<{}>] Node {} closed its end of the connection",
                self.local_id, self.target
            );
            *stream = None;
        }
        if stream.is_none() {
            *stream = Some(self.open().await?);
        }
        let Some(conn) = stream.as_mut() else {
            return Err(transport_error!("No connection to node {}", self.target));
        };
        let outcome = timeout(self.config.io_timeout, write_frame(conn, payload)).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *stream = None;
                Err(e)
            }
            Err(_) => {
                *stream = None;
                Err(transport_error!("Send to node {} timed out", self.target))
            }
        }
    }

    /// Dial the peer and introduce ourselves.
    async fn open(&self) -> Result<TcpStream> {
        let mut stream = timeout(self.config.io_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| transport_error!("Connect to node {} timed out", self.target))?
            .map_err(|e| {
                transport_error!("Connect to node {} at {} failed: {}", self.target, self.addr, e)
            })?;
        stream.set_nodelay(true)?;
        timeout(
            self.config.io_timeout,
            write_frame(&mut stream, &self.handshake),
        )
        .await
        .map_err(|_| transport_error!("Handshake with node {} timed out", self.target))??;
        self.stats
            .connections_opened
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            "[Node<{}>] Connected to node {} at {}",
            self.local_id, self.target, self.addr
        );
        Ok(stream)
    }

    /// Connect with bounded exponential backoff unless already connected.
    async fn connect(&self) -> Result<()> {
        let mut stream = self.stream.lock().await;
        if stream.is_some() {
            return Ok(());
        }
        let mut backoff = self.config.connect_backoff_initial;
        let mut last_error = None;
        for attempt in 1..=self.config.connect_attempts.max(1) {
            match self.open().await {
                Ok(conn) => {
                    *stream = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        "[Node<{}>] Attempt {} to reach node {} failed: {}",
                        self.local_id, attempt, self.target, e
                    );
                    last_error = Some(e);
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.connect_backoff_max);
        }
        Err(last_error.unwrap_or_else(|| transport_error!("Node {} unreachable", self.target)))
    }

    async fn disconnect(&self) {
        self.stream.lock().await.take();
    }
}

/// Peers never write on a connection we dialed, so anything readable on it
/// is either EOF or an error. A write to such a half-closed socket would
/// still succeed locally and the frame would be lost.
fn peer_hung_up(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Ok(_) | Err(_) => true,
    }
}

/// What a receive loop needs to validate and forward frames
#[derive(Clone)]
struct ReceiveContext {
    local_id: NodeId,
    cluster_size: usize,
    io_timeout: Duration,
    inbox: mpsc::Sender<Inbound>,
    stats: Arc<MessengerStats>,
}

impl ReceiveContext {
    async fn handshake(&self, stream: &mut TcpStream) -> Result<NodeId> {
        let frame = timeout(self.io_timeout, read_frame(stream))
            .await
            .map_err(|_| transport_error!("Handshake timed out"))??
            .ok_or_else(|| transport_error!("Connection closed before handshake"))?;
        let handshake = Handshake::deserialize(&frame)?;
        if handshake.cluster_size as usize != self.cluster_size {
            return Err(transport_error!(
                "Node {} believes the cluster has {} nodes, expected {}",
                handshake.node_id,
                handshake.cluster_size,
                self.cluster_size
            ));
        }
        if !handshake.node_id.is_member_of(self.cluster_size) || handshake.node_id == self.local_id
        {
            return Err(transport_error!(
                "Handshake from invalid node id {}",
                handshake.node_id
            ));
        }
        Ok(handshake.node_id)
    }

    async fn run(self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let from = match self.handshake(&mut stream).await {
            Ok(from) => from,
            Err(e) => {
                self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[Node<{}>] Rejected connection from {}: {}",
                    self.local_id, peer_addr, e
                );
                return;
            }
        };
        debug!(
            "[Node<{}>] Accepted connection from node {} ({})",
            self.local_id, from, peer_addr
        );

        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("[Node<{}>] Node {} closed its connection", self.local_id, from);
                    return;
                }
                Err(e) => {
                    self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[Node<{}>] Dropping connection from node {}: {}",
                        self.local_id, from, e
                    );
                    return;
                }
            };
            let message = match Message::deserialize(&frame) {
                Ok(message) if message.sender() == from => message,
                Ok(message) => {
                    self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[Node<{}>] Node {} sent a message claiming to be from node {}",
                        self.local_id,
                        from,
                        message.sender()
                    );
                    return;
                }
                Err(e) => {
                    self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[Node<{}>] Malformed frame from node {}: {}",
                        self.local_id, from, e
                    );
                    return;
                }
            };
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            if self.inbox.send(Inbound { from, message }).await.is_err() {
                debug!("[Node<{}>] Inbox closed, stopping receive loop", self.local_id);
                return;
            }
        }
    }
}

/// Accept connections until aborted. Dropping this future drops the listener
/// and every receive loop it spawned.
async fn accept_loop(listener: TcpListener, ctx: ReceiveContext) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    ctx.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("[Node<{}>] set_nodelay failed: {}", ctx.local_id, e);
                    }
                    connections.spawn(ctx.clone().run(stream, peer_addr));
                }
                Err(e) => {
                    warn!("[Node<{}>] TCP accept failed: {}", ctx.local_id, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

pub struct Messenger {
    node_id: NodeId,
    cluster_size: usize,
    local_addr: SocketAddr,
    config: MessengerConfig,
    links: IndexMap<NodeId, Arc<PeerLink>>,
    listener: Mutex<Option<TcpListener>>,
    inbox: Mutex<Option<mpsc::Sender<Inbound>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
    closed: AtomicBool,
    stats: Arc<MessengerStats>,
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("node_id", &self.node_id)
            .field("local_addr", &self.local_addr)
            .field("peers", &self.links.keys().collect::<Vec<_>>())
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl Messenger {
    /// Bind the node's listen address.
    pub async fn bind(settings: &NodeSettings) -> Result<Self> {
        let listener = TcpListener::bind(settings.listen_addr).await.map_err(|e| {
            transport_error!("Failed to bind {}: {}", settings.listen_addr, e)
        })?;
        Self::from_listener(settings, listener)
    }

    /// Use an already bound listener (ephemeral-port clusters bind every
    /// listener before any node starts).
    pub fn from_listener(settings: &NodeSettings, listener: TcpListener) -> Result<Self> {
        settings.validate()?;
        let local_addr = listener.local_addr()?;
        let stats = Arc::new(MessengerStats::default());
        let handshake = Bytes::from(
            Handshake {
                node_id: settings.node_id,
                cluster_size: u32::try_from(settings.cluster_size)?,
            }
            .serialize()?,
        );

        let links = settings
            .peers
            .iter()
            .map(|(peer, addr)| {
                let link = PeerLink {
                    local_id: settings.node_id,
                    target: *peer,
                    addr: *addr,
                    handshake: handshake.clone(),
                    config: settings.messenger.clone(),
                    stream: AsyncMutex::new(None),
                    stats: stats.clone(),
                };
                (*peer, Arc::new(link))
            })
            .collect();

        info!(
            "[Node<{}>] Messenger listening on {} with {} peers",
            settings.node_id,
            local_addr,
            settings.peers.len()
        );
        Ok(Self {
            node_id: settings.node_id,
            cluster_size: settings.cluster_size,
            local_addr,
            config: settings.messenger.clone(),
            links,
            listener: Mutex::new(Some(listener)),
            inbox: Mutex::new(None),
            accept_task: Mutex::new(None),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            stats,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> FrozenMessengerStats {
        self.stats.freeze()
    }

    /// Start accepting connections; inbound messages go to `inbox`.
    pub fn listen(&self, inbox: mpsc::Sender<Inbound>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .map_err(|_| concurrency_error!("Messenger listener lock poisoned"))?
            .take()
            .ok_or_else(|| transport_error!("Node {} is already listening", self.node_id))?;
        *self
            .inbox
            .lock()
            .map_err(|_| concurrency_error!("Messenger inbox lock poisoned"))? = Some(inbox.clone());
        self.spawn_accept(listener, inbox)
    }

    fn spawn_accept(&self, listener: TcpListener, inbox: mpsc::Sender<Inbound>) -> Result<()> {
        let ctx = ReceiveContext {
            local_id: self.node_id,
            cluster_size: self.cluster_size,
            io_timeout: self.config.io_timeout,
            inbox,
            stats: self.stats.clone(),
        };
        let handle = tokio::spawn(accept_loop(listener, ctx));
        let previous = self
            .accept_task
            .lock()
            .map_err(|_| concurrency_error!("Messenger task lock poisoned"))?
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Dial every peer with backoff. Returns the peers that stayed
    /// unreachable; sends to them will keep trying to connect.
    pub async fn connect_all(&self) -> Vec<NodeId> {
        let mut unreachable = Vec::new();
        for (peer, link) in &self.links {
            if let Err(e) = link.connect().await {
                warn!("[Node<{}>] Could not reach node {}: {}", self.node_id, peer, e);
                unreachable.push(*peer);
            }
        }
        unreachable
    }

    fn link(&self, target: NodeId) -> Result<Arc<PeerLink>> {
        self.links
            .get(&target)
            .cloned()
            .ok_or_else(|| TokenMeshError::unknown_node(target))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(transport_error!("Node {} is suspended", self.node_id))
        }
    }

    async fn stop_accepting(&self) {
        let handle = match self.accept_task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.abort();
            // wait for the listener to actually be dropped
            let _ = handle.await;
        }
    }

    async fn disconnect_all(&self) {
        for link in self.links.values() {
            link.disconnect().await;
        }
    }
}

#[async_trait]
impl PeerSender for Messenger {
    async fn send(&self, target: NodeId, message: &Message) -> Result<()> {
        self.ensure_active()?;
        let link = self.link(target)?;
        let payload = message.serialize()?;
        link.send(&payload).await
    }

    async fn broadcast(&self, message: &Message) -> Vec<(NodeId, TokenMeshError)> {
        if let Err(e) = self.ensure_active() {
            return self
                .links
                .keys()
                .map(|peer| (*peer, transport_error!("{}", e)))
                .collect();
        }
        let payload = match message.serialize() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                let reason = e.to_string();
                return self
                    .links
                    .keys()
                    .map(|peer| (*peer, transport_error!("{}", reason)))
                    .collect();
            }
        };

        let mut sends = JoinSet::new();
        for (peer, link) in &self.links {
            let peer = *peer;
            let link = link.clone();
            let payload = payload.clone();
            sends.spawn(async move { (peer, link.send(&payload).await) });
        }

        let mut failures = Vec::new();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((peer, Err(e))) => {
                    warn!(
                        "[Node<{}>] Broadcast of {} to node {} failed: {}",
                        self.node_id,
                        message.kind(),
                        peer,
                        e
                    );
                    failures.push((peer, e));
                }
                Err(e) => warn!("[Node<{}>] Broadcast task failed: {}", self.node_id, e),
            }
        }
        failures
    }

    async fn suspend(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop_accepting().await;
        self.disconnect_all().await;
        info!("[Node<{}>] Messenger suspended", self.node_id);
    }

    async fn resume(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(transport_error!("Node {} is shut down", self.node_id));
        }
        if self.is_active() {
            return Ok(());
        }
        let inbox = self
            .inbox
            .lock()
            .map_err(|_| concurrency_error!("Messenger inbox lock poisoned"))?
            .clone();

        if let Some(inbox) = inbox {
            let mut backoff = self.config.connect_backoff_initial;
            let mut attempts = 0;
            let listener = loop {
                match TcpListener::bind(self.local_addr).await {
                    Ok(listener) => break listener,
                    Err(e) if attempts < self.config.connect_attempts => {
                        attempts += 1;
                        debug!(
                            "[Node<{}>] Rebinding {} failed: {}",
                            self.node_id, self.local_addr, e
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.connect_backoff_max);
                    }
                    Err(e) => {
                        return Err(transport_error!(
                            "Failed to rebind {}: {}",
                            self.local_addr,
                            e
                        ))
                    }
                }
            };
            self.spawn_accept(listener, inbox)?;
        }
        self.active.store(true, Ordering::Release);
        info!("[Node<{}>] Messenger resumed on {}", self.node_id, self.local_addr);
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.active.store(false, Ordering::Release);
        self.stop_accepting().await;
        self.disconnect_all().await;
        if let Ok(mut listener) = self.listener.lock() {
            listener.take();
        }
        debug!("[Node<{}>] Messenger shut down", self.node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TokenRecord;
    use crate::settings::Timing;

    fn node_settings(node_id: u32, addrs: &[SocketAddr]) -> NodeSettings {
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
                connect_attempts: 3,
                connect_backoff_initial: Duration::from_millis(10),
                connect_backoff_max: Duration::from_millis(20),
                io_timeout: Duration::from_millis(500),
            },
        }
    }

    async fn pair() -> (Messenger, Messenger, mpsc::Receiver<Inbound>, mpsc::Receiver<Inbound>) {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addrs = vec![first.local_addr().unwrap(), second.local_addr().unwrap()];

        let a = Messenger::from_listener(&node_settings(0, &addrs), first).unwrap();
        let b = Messenger::from_listener(&node_settings(1, &addrs), second).unwrap();
        let (a_tx, a_rx) = mpsc::channel(16);
        let (b_tx, b_rx) = mpsc::channel(16);
        a.listen(a_tx).unwrap();
        b.listen(b_tx).unwrap();
        (a, b, a_rx, b_rx)
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (a, b, _a_rx, mut b_rx) = pair().await;
        assert!(a.connect_all().await.is_empty());

        let message = Message::Request {
            sender: NodeId::new(0),
            clock: 3,
        };
        a.send(NodeId::new(1), &message).await.unwrap();

        let inbound = b_rx.recv().await.unwrap();
        assert_eq!(inbound.from, NodeId::new(0));
        assert_eq!(inbound.message, message);
        assert_eq!(a.stats().messages_sent, 1);
        assert_eq!(b.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_rejected() {
        let (a, _b, _a_rx, _b_rx) = pair().await;
        let message = Message::Request {
            sender: NodeId::new(0),
            clock: 1,
        };
        assert!(a.send(NodeId::new(5), &message).await.is_err());
    }

    #[tokio::test]
    async fn test_suspended_messenger_refuses_to_send() {
        let (a, b, _a_rx, mut b_rx) = pair().await;
        a.suspend().await;
        let message = Message::Request {
            sender: NodeId::new(0),
            clock: 1,
        };
        assert!(a.send(NodeId::new(1), &message).await.is_err());
        assert_eq!(a.broadcast(&message).await.len(), 1);

        a.resume().await.unwrap();
        a.send(NodeId::new(1), &message).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap().message, message);
        drop(b);
    }

    #[tokio::test]
    async fn test_token_to_suspended_peer_is_reported_undelivered() {
        let (a, b, _a_rx, mut b_rx) = pair().await;
        assert!(a.connect_all().await.is_empty());
        let request = Message::Request {
            sender: NodeId::new(0),
            clock: 1,
        };
        a.send(NodeId::new(1), &request).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap().message, request);

        // b crashes; a still holds its old outbound connection
        b.suspend().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let token = Message::Token {
            sender: NodeId::new(0),
            clock: 2,
            token: TokenRecord::new(2),
        };
        assert!(a.send(NodeId::new(1), &token).await.is_err());
        assert_eq!(a.stats().send_errors, 1);

        b.resume().await.unwrap();
        a.send(NodeId::new(1), &token).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap().message, token);
    }
}
