use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokenmesh::cluster::{self, FaultSimulator, LocalCluster};
use tokenmesh::node::Node;
use tokenmesh::observability::{FanoutSink, SnapshotBoard, StateSink, TracingSink};
use tokenmesh::{api, cli, settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenmesh=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings()?;
    let cluster = Arc::new(start_nodes(&settings).await?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut background = tokio::task::JoinSet::new();
    background.spawn(cluster::report_stats(
        cluster.clone(),
        settings.stats_interval,
        shutdown_rx.clone(),
    ));
    if settings.faults.enabled {
        if settings.node_id.is_some() {
            warn!("Fault simulator only runs for in-process clusters; ignoring --faults");
        } else {
            let simulator = FaultSimulator::new(cluster.clone(), settings.faults.clone());
            background.spawn(simulator.run(shutdown_rx.clone()));
        }
    }

    match settings.http_address() {
        Some(address) => {
            let listener = tokio::net::TcpListener::bind(address).await?;
            info!("Starting {} status API on {}", settings::APP_NAME, address);
            axum::serve(listener, api::api(cluster.clone()))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        None => shutdown_signal().await,
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    while background.join_next().await.is_some() {}
    cluster.stop().await;
    Ok(())
}

/// Either this process's single node or the whole mesh
async fn start_nodes(settings: &settings::Settings) -> anyhow::Result<LocalCluster> {
    let tracing_sink: Arc<dyn StateSink> = Arc::new(TracingSink);
    match settings.node_id {
        Some(node_id) => {
            let board = SnapshotBoard::new();
            let sink = FanoutSink::new(vec![tracing_sink, Arc::new(board.clone())]);
            let node_settings = settings.node_settings(node_id)?;
            info!(
                "Starting node {} of {} on {}",
                node_id, settings.nodes, node_settings.listen_addr
            );
            let node = Node::start(&node_settings, Arc::new(sink)).await?;
            Ok(LocalCluster::from_node(node, board))
        }
        None => {
            info!(
                "Starting {} nodes in-process from base port {}",
                settings.nodes, settings.base_port
            );
            Ok(LocalCluster::start(settings, tracing_sink).await?)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }
}
