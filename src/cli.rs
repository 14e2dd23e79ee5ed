//! CLI for this application
//!
use std::net::IpAddr;
use std::time::Duration;

use crate::config_error;
use crate::error::Result;
use crate::node::NodeId;
use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[command(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Address every node listens on
    #[clap(
        long,
        default_value = "127.0.0.1",
        env("TOKENMESH_HOST"),
        help = "IP Address nodes listen on"
    )]
    pub host: IpAddr,

    // Node i listens on base_port + i
    #[clap(
        long,
        default_value = settings::DEFAULT_BASE_PORT,
        env("TOKENMESH_BASE_PORT"),
        help = "Base TCP port; node i listens on base-port + i (0 = ephemeral, in-process only)"
    )]
    pub base_port: u16,

    // Cluster size
    #[clap(
        long,
        default_value = settings::DEFAULT_NODE_COUNT,
        env("TOKENMESH_NODES"),
        help = "Number of nodes in the mesh"
    )]
    pub nodes: usize,

    // Run only this node; all nodes run in-process when absent
    #[clap(
        long,
        env("TOKENMESH_NODE_ID"),
        help = "Id of the node this process runs. Runs the whole cluster in-process if omitted"
    )]
    pub node_id: Option<u32>,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("TOKENMESH_HTTP_PORT"),
        help = "Port to bind the status API to"
    )]
    pub http_port: u16,

    #[clap(long, env("TOKENMESH_NO_HTTP"), help = "Do not start the status API")]
    pub no_http: bool,

    // In-process cluster transport
    #[clap(
        long,
        default_value = "tcp",
        env("TOKENMESH_TRANSPORT"),
        help = "In-process cluster transport: 'tcp' or 'memory'"
    )]
    pub transport: settings::TransportMode,

    // Token regeneration
    #[clap(
        long,
        default_value = "0",
        env("TOKENMESH_REGENERATOR"),
        help = "Node allowed to regenerate a lost token"
    )]
    pub regenerator: u32,

    #[clap(
        long,
        env("TOKENMESH_NO_REGENERATION"),
        help = "Disable token regeneration"
    )]
    pub no_regeneration: bool,

    #[clap(long, default_value = "60000", env("TOKENMESH_TOKEN_LOSS_TIMEOUT_MS"))]
    pub token_loss_timeout_ms: u64,

    #[clap(long, default_value = "2000", env("TOKENMESH_REGENERATION_CHECK_MS"))]
    pub regeneration_check_ms: u64,

    #[clap(long, default_value = "5000", env("TOKENMESH_REQUEST_REFRESH_MS"))]
    pub request_refresh_ms: u64,

    // Coordination loop timing
    #[clap(long, default_value = "1000", env("TOKENMESH_THINK_MIN_MS"))]
    pub think_min_ms: u64,

    #[clap(long, default_value = "5000", env("TOKENMESH_THINK_MAX_MS"))]
    pub think_max_ms: u64,

    #[clap(long, default_value = "1000", env("TOKENMESH_WORK_MIN_MS"))]
    pub work_min_ms: u64,

    #[clap(long, default_value = "3000", env("TOKENMESH_WORK_MAX_MS"))]
    pub work_max_ms: u64,

    // Fault simulator (in-process cluster only)
    #[clap(long, env("TOKENMESH_FAULTS"), help = "Randomly fail and recover nodes")]
    pub faults: bool,

    #[clap(long, default_value = "5000", env("TOKENMESH_FAULT_INTERVAL_MIN_MS"))]
    pub fault_interval_min_ms: u64,

    #[clap(long, default_value = "15000", env("TOKENMESH_FAULT_INTERVAL_MAX_MS"))]
    pub fault_interval_max_ms: u64,

    #[clap(long, default_value = "3000", env("TOKENMESH_FAULT_DOWNTIME_MIN_MS"))]
    pub fault_downtime_min_ms: u64,

    #[clap(long, default_value = "8000", env("TOKENMESH_FAULT_DOWNTIME_MAX_MS"))]
    pub fault_downtime_max_ms: u64,

    // Messenger
    #[clap(long, default_value = "20", env("TOKENMESH_CONNECT_ATTEMPTS"))]
    pub connect_attempts: u32,

    #[clap(long, default_value = "500", env("TOKENMESH_IO_TIMEOUT_MS"))]
    pub io_timeout_ms: u64,

    #[clap(long, default_value = "2000", env("TOKENMESH_STATS_INTERVAL_MS"))]
    pub stats_interval_ms: u64,

    #[clap(long, default_value = "2000", env("TOKENMESH_SHUTDOWN_GRACE_MS"))]
    pub shutdown_grace_ms: u64,
}

impl Cli {
    pub fn into_settings(self) -> Result<settings::Settings> {
        if self.nodes == 0 {
            return Err(config_error!("--nodes must be at least 1"));
        }
        if let Some(node_id) = self.node_id {
            if node_id as usize >= self.nodes {
                return Err(config_error!(
                    "--node-id {} is outside a cluster of {} nodes",
                    node_id,
                    self.nodes
                ));
            }
            if self.base_port == 0 {
                return Err(config_error!(
                    "A fixed --base-port is required when running a single node"
                ));
            }
        }
        if !self.no_regeneration && self.regenerator as usize >= self.nodes {
            return Err(config_error!(
                "--regenerator {} is outside a cluster of {} nodes",
                self.regenerator,
                self.nodes
            ));
        }

        let defaults = settings::MessengerConfig::default();
        Ok(settings::Settings {
            host: self.host,
            base_port: self.base_port,
            nodes: self.nodes,
            node_id: self.node_id.map(NodeId::new),
            http_port: (!self.no_http).then_some(self.http_port),
            transport: self.transport,
            regenerator: (!self.no_regeneration).then(|| NodeId::new(self.regenerator)),
            timing: settings::Timing {
                think: settings::MillisRange::new(self.think_min_ms, self.think_max_ms),
                work: settings::MillisRange::new(self.work_min_ms, self.work_max_ms),
                request_refresh: Duration::from_millis(self.request_refresh_ms.max(1)),
                regeneration_check: Duration::from_millis(self.regeneration_check_ms.max(1)),
                token_loss_timeout: Duration::from_millis(self.token_loss_timeout_ms),
                shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            },
            messenger: settings::MessengerConfig {
                connect_attempts: self.connect_attempts,
                io_timeout: Duration::from_millis(self.io_timeout_ms),
                ..defaults
            },
            faults: settings::FaultSettings {
                enabled: self.faults,
                interval: settings::MillisRange::new(
                    self.fault_interval_min_ms,
                    self.fault_interval_max_ms,
                ),
                downtime: settings::MillisRange::new(
                    self.fault_downtime_min_ms,
                    self.fault_downtime_max_ms,
                ),
            },
            stats_interval: Duration::from_millis(self.stats_interval_ms.max(1)),
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_defaults_match_settings() {
        let settings = Cli::parse_from(["tokenmesh"]).into_settings().unwrap();
        assert_eq!(settings.nodes, 10);
        assert_eq!(settings.base_port, settings::STANDARD_BASE_PORT);
        assert_eq!(settings.http_port, Some(settings::STANDARD_PORT_HTTP));
        assert_eq!(settings.regenerator, Some(NodeId::new(0)));
        assert_eq!(settings.timing.work, settings::MillisRange::new(1000, 3000));
        assert!(!settings.faults.enabled);
        assert!(settings.node_id.is_none());
    }

    #[test]
    fn test_single_node_flags() {
        let settings = Cli::parse_from([
            "tokenmesh",
            "--nodes",
            "3",
            "--node-id",
            "2",
            "--no-http",
            "--no-regeneration",
            "--transport",
            "memory",
        ])
        .into_settings()
        .unwrap();
        assert_eq!(settings.node_id, Some(NodeId::new(2)));
        assert!(settings.http_port.is_none());
        assert!(settings.regenerator.is_none());
        assert_eq!(settings.transport, settings::TransportMode::Memory);
    }

    #[test]
    fn test_node_id_outside_cluster_is_rejected() {
        let cli = Cli::parse_from(["tokenmesh", "--nodes", "3", "--node-id", "3"]);
        assert!(cli.into_settings().is_err());
    }
}
