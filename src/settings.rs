//! tokenmesh application settings
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use indexmap::IndexMap;

use crate::config_error;
use crate::error::Result;
use crate::node::NodeId;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_BASE_PORT: u16 = 8000;
pub const DEFAULT_BASE_PORT: &str = "8000";
pub const STANDARD_PORT_HTTP: u16 = 9000;
pub const DEFAULT_PORT_HTTP: &str = "9000";
pub const DEFAULT_NODE_COUNT: &str = "10";

/// Node that fabricates a new token when the current one looks lost
pub const DEFAULT_REGENERATOR: u32 = 0;
/// Node that holds the token at startup
pub const INITIAL_TOKEN_HOLDER: NodeId = NodeId::new(0);

/// How a local cluster wires its nodes together
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Memory,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Tcp => write!(f, "tcp"),
            TransportMode::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(TransportMode::Tcp),
            "memory" => Ok(TransportMode::Memory),
            _ => Err(format!("Invalid transport mode: {}", s)),
        }
    }
}

/// Inclusive millisecond range used for randomised sleeps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MillisRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl MillisRange {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min_ms: min_ms.min(max_ms),
            max_ms: min_ms.max(max_ms),
        }
    }

    pub fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_millis(rng.random_range(self.min_ms..=self.max_ms))
    }
}

/// Timing knobs of the coordination loop and failure controller
#[derive(Clone, Debug)]
pub struct Timing {
    pub think: MillisRange,
    pub work: MillisRange,
    pub request_refresh: Duration,
    pub regeneration_check: Duration,
    pub token_loss_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            think: MillisRange::new(1000, 5000),
            work: MillisRange::new(1000, 3000),
            request_refresh: Duration::from_secs(5),
            regeneration_check: Duration::from_secs(2),
            token_loss_timeout: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Messenger connection behaviour
#[derive(Clone, Debug)]
pub struct MessengerConfig {
    pub connect_attempts: u32,
    pub connect_backoff_initial: Duration,
    pub connect_backoff_max: Duration,
    pub io_timeout: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 20,
            connect_backoff_initial: Duration::from_millis(50),
            connect_backoff_max: Duration::from_secs(1),
            io_timeout: Duration::from_millis(500),
        }
    }
}

/// Fault simulator behaviour for local clusters
#[derive(Clone, Debug)]
pub struct FaultSettings {
    pub enabled: bool,
    /// Time between the end of one outage and the next failure
    pub interval: MillisRange,
    /// How long a failed node stays down
    pub downtime: MillisRange,
}

impl Default for FaultSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: MillisRange::new(5000, 15000),
            downtime: MillisRange::new(3000, 8000),
        }
    }
}

/// Everything one node needs to run
#[derive(Clone, Debug)]
pub struct NodeSettings {
    pub node_id: NodeId,
    pub cluster_size: usize,
    pub initial_holder: NodeId,
    pub regenerator: Option<NodeId>,
    pub listen_addr: SocketAddr,
    pub peers: IndexMap<NodeId, SocketAddr>,
    pub timing: Timing,
    pub messenger: MessengerConfig,
}

impl NodeSettings {
    pub fn starts_with_token(&self) -> bool {
        self.node_id == self.initial_holder
    }

    pub fn is_regenerator(&self) -> bool {
        self.regenerator == Some(self.node_id)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_size == 0 {
            return Err(config_error!("Cluster must contain at least one node"));
        }
        if !self.node_id.is_member_of(self.cluster_size) {
            return Err(config_error!(
                "Node id {} is outside a cluster of {} nodes",
                self.node_id,
                self.cluster_size
            ));
        }
        if !self.initial_holder.is_member_of(self.cluster_size) {
            return Err(config_error!(
                "Initial token holder {} is outside the cluster",
                self.initial_holder
            ));
        }
        if let Some(regenerator) = self.regenerator {
            if !regenerator.is_member_of(self.cluster_size) {
                return Err(config_error!(
                    "Regenerator {} is outside the cluster",
                    regenerator
                ));
            }
        }
        for peer in self.node_id.peers(self.cluster_size) {
            if !self.peers.contains_key(&peer) {
                return Err(config_error!("Missing address for peer {}", peer));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    // Address every node listens on
    pub host: IpAddr,

    // Node i listens on base_port + i
    pub base_port: u16,

    // Total number of nodes (N)
    pub nodes: usize,

    // This process's node id; None runs the whole cluster in-process
    pub node_id: Option<NodeId>,

    // HTTP status API port; None disables the API
    pub http_port: Option<u16>,

    pub transport: TransportMode,
    pub regenerator: Option<NodeId>,
    pub timing: Timing,
    pub messenger: MessengerConfig,
    pub faults: FaultSettings,

    // Periodic cluster summary logging
    pub stats_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            base_port: STANDARD_BASE_PORT,
            nodes: 10,
            node_id: None,
            http_port: Some(STANDARD_PORT_HTTP),
            transport: TransportMode::Tcp,
            regenerator: Some(NodeId::new(DEFAULT_REGENERATOR)),
            timing: Timing::default(),
            messenger: MessengerConfig::default(),
            faults: FaultSettings::default(),
            stats_interval: Duration::from_secs(2),
        }
    }
}

impl Settings {
    /// Port derivation rule: `base_port + node_id`
    pub fn node_address(&self, node_id: NodeId) -> Result<SocketAddr> {
        let offset = u16::try_from(node_id.value())?;
        let port = self.base_port.checked_add(offset).ok_or_else(|| {
            config_error!(
                "Port for node {} overflows (base port {})",
                node_id,
                self.base_port
            )
        })?;
        Ok(SocketAddr::new(self.host, port))
    }

    pub fn node_settings(&self, node_id: NodeId) -> Result<NodeSettings> {
        let mut peers = IndexMap::new();
        for peer in node_id.peers(self.nodes) {
            peers.insert(peer, self.node_address(peer)?);
        }
        let node_settings = NodeSettings {
            node_id,
            cluster_size: self.nodes,
            initial_holder: INITIAL_TOKEN_HOLDER,
            regenerator: self.regenerator,
            listen_addr: self.node_address(node_id)?,
            peers,
            timing: self.timing.clone(),
            messenger: self.messenger.clone(),
        };
        node_settings.validate()?;
        Ok(node_settings)
    }

    pub fn http_address(&self) -> Option<SocketAddr> {
        self.http_port.map(|port| SocketAddr::new(self.host, port))
    }
}
