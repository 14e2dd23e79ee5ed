//! In-process clusters
//!
//! [`LocalCluster`] runs every node of a mesh inside one process, either over
//! real TCP sockets or over the in-memory loopback. [`FaultSimulator`] crashes
//! a random node now and then and brings it back after a while.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Result, TokenMeshError};
use crate::node::{Node, NodeId};
use crate::observability::{ClusterSnapshot, FanoutSink, SnapshotBoard, StateSink};
use crate::settings::{FaultSettings, Settings, TransportMode};
use crate::transport::{LoopbackHub, Messenger};
use crate::transport_error;

pub struct LocalCluster {
    nodes: IndexMap<NodeId, Arc<Node>>,
    board: SnapshotBoard,
    transport: TransportMode,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("transport", &self.transport)
            .finish()
    }
}

impl LocalCluster {
    /// Start all `settings.nodes` nodes. A base port of 0 gives every node an
    /// ephemeral port.
    pub async fn start(settings: &Settings, sink: Arc<dyn StateSink>) -> Result<Self> {
        let board = SnapshotBoard::new();
        let sink: Arc<dyn StateSink> = Arc::new(FanoutSink::new(vec![
            Arc::new(board.clone()) as Arc<dyn StateSink>,
            sink,
        ]));

        let nodes = match settings.transport {
            TransportMode::Tcp => Self::start_tcp(settings, sink).await?,
            TransportMode::Memory => Self::start_memory(settings, sink)?,
        };
        info!(
            "Local cluster of {} nodes running over {}",
            nodes.len(),
            settings.transport
        );
        Ok(Self {
            nodes,
            board,
            transport: settings.transport,
        })
    }

    /// Wrap a single already running node, e.g. one node of a multi-process
    /// mesh, so it can be served by the HTTP API.
    pub fn from_node(node: Node, board: SnapshotBoard) -> Self {
        let mut nodes = IndexMap::new();
        nodes.insert(node.id(), Arc::new(node));
        Self {
            nodes,
            board,
            transport: TransportMode::Tcp,
        }
    }

    async fn start_tcp(
        settings: &Settings,
        sink: Arc<dyn StateSink>,
    ) -> Result<IndexMap<NodeId, Arc<Node>>> {
        let ids: Vec<NodeId> = (0..settings.nodes as u32).map(NodeId::new).collect();

        // Bind everything first so that every node can dial every other one.
        let mut listeners = Vec::with_capacity(ids.len());
        for id in &ids {
            let addr = if settings.base_port == 0 {
                SocketAddr::new(settings.host, 0)
            } else {
                settings.node_address(*id)?
            };
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| transport_error!("Failed to bind {}: {}", addr, e))?;
            listeners.push(listener);
        }
        let addrs = listeners
            .iter()
            .map(|listener| listener.local_addr())
            .collect::<std::io::Result<Vec<SocketAddr>>>()?;

        let mut nodes = IndexMap::new();
        for (id, listener) in ids.iter().zip(listeners) {
            let mut node_settings = settings.node_settings(*id)?;
            node_settings.listen_addr = addrs[id.index()];
            node_settings.peers = id
                .peers(settings.nodes)
                .map(|peer| (peer, addrs[peer.index()]))
                .collect();
            let messenger = Messenger::from_listener(&node_settings, listener)?;
            let node = Node::start_with_messenger(&node_settings, messenger, sink.clone()).await?;
            nodes.insert(*id, Arc::new(node));
        }
        Ok(nodes)
    }

    fn start_memory(
        settings: &Settings,
        sink: Arc<dyn StateSink>,
    ) -> Result<IndexMap<NodeId, Arc<Node>>> {
        let hub = LoopbackHub::new();
        let ids: Vec<NodeId> = (0..settings.nodes as u32).map(NodeId::new).collect();
        let endpoints: Vec<_> = ids
            .iter()
            .map(|id| hub.register(*id, settings.nodes))
            .collect();

        let mut nodes = IndexMap::new();
        for (id, (sender, inbox)) in ids.iter().zip(endpoints) {
            let node_settings = settings.node_settings(*id)?;
            let node = Node::launch(&node_settings, Arc::new(sender), inbox, sink.clone())?;
            nodes.insert(*id, Arc::new(node));
        }
        Ok(nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Size of the whole mesh, including nodes running elsewhere
    pub fn cluster_size(&self) -> usize {
        self.nodes
            .values()
            .next()
            .map(|node| node.cluster_size())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.get(&node_id)
    }

    pub fn board(&self) -> &SnapshotBoard {
        &self.board
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        self.board.snapshot()
    }

    fn require(&self, node_id: NodeId) -> Result<&Arc<Node>> {
        self.node(node_id)
            .ok_or_else(|| TokenMeshError::unknown_node(node_id))
    }

    pub async fn fail(&self, node_id: NodeId) -> Result<()> {
        self.require(node_id)?.fail().await
    }

    pub async fn recover(&self, node_id: NodeId) -> Result<()> {
        self.require(node_id)?.recover().await
    }

    pub async fn stop(&self) {
        for node in self.nodes.values() {
            node.stop().await;
        }
        info!("Local cluster stopped");
    }
}

/// Randomly crashes and restores nodes of a [`LocalCluster`]
pub struct FaultSimulator {
    cluster: Arc<LocalCluster>,
    settings: FaultSettings,
    rng: StdRng,
}

impl FaultSimulator {
    pub fn new(cluster: Arc<LocalCluster>, settings: FaultSettings) -> Self {
        Self {
            cluster,
            settings,
            rng: StdRng::from_os_rng(),
        }
    }

    /// One failure at a time: wait, fail a random node, wait out its
    /// downtime, recover it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let ids = self.cluster.node_ids();
        if ids.is_empty() {
            return;
        }
        info!("Fault simulator started");
        loop {
            let interval = self.settings.interval.sample(&mut self.rng);
            if !sleep_unless_shutdown(interval, &mut shutdown).await {
                break;
            }

            let victim = ids[self.rng.random_range(0..ids.len())];
            let downtime = self.settings.downtime.sample(&mut self.rng);
            if let Err(e) = self.cluster.fail(victim).await {
                warn!("Fault simulator could not fail node {}: {}", victim, e);
                continue;
            }
            info!("Simulating failure of node {} for {:?}", victim, downtime);

            let keep_going = sleep_unless_shutdown(downtime, &mut shutdown).await;
            if let Err(e) = self.cluster.recover(victim).await {
                warn!("Fault simulator could not recover node {}: {}", victim, e);
            }
            if !keep_going {
                break;
            }
        }
        info!("Fault simulator stopped");
    }
}

/// Log a cluster summary every `every` until shutdown.
pub async fn report_stats(
    cluster: Arc<LocalCluster>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cluster.board().log_summary();
                for node_id in cluster.node_ids() {
                    let Some(node) = cluster.node(node_id) else {
                        continue;
                    };
                    if let Ok(stats) = node.stats() {
                        tracing::debug!(
                            node_id = node_id.value(),
                            cs_entries = stats.cs_entries,
                            tokens_sent = stats.tokens_sent,
                            tokens_reclaimed = stats.tokens_reclaimed,
                            tokens_lost = stats.tokens_lost,
                            regenerations = stats.regenerations,
                            "[Node<{}>] protocol stats", node_id
                        );
                    }
                    if let Some(transport) = node.transport_stats() {
                        tracing::debug!(
                            node_id = node_id.value(),
                            sent = transport.messages_sent,
                            received = transport.messages_received,
                            send_errors = transport.send_errors,
                            receive_errors = transport.receive_errors,
                            reconnects = transport.reconnects,
                            "[Node<{}>] transport stats", node_id
                        );
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn sleep_unless_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
