use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{event, instrument, Level};

use crate::cluster::LocalCluster;
use crate::error::{Result, TokenMeshError};
use crate::node::NodeId;
use crate::observability::{ClusterSnapshot, StatusUpdate};

/// Latest known state of every local node
#[instrument(skip(state), level = "debug")]
pub async fn cluster_snapshot(State(state): State<Arc<LocalCluster>>) -> Json<ClusterSnapshot> {
    Json(state.snapshot())
}

/// Live status of one node, read straight from its protocol state
#[instrument(skip(state), level = "debug")]
pub async fn node_status(
    State(state): State<Arc<LocalCluster>>,
    Path(node_id): Path<u32>,
) -> Result<Json<StatusUpdate>> {
    let node_id = NodeId::new(node_id);
    let node = state
        .node(node_id)
        .ok_or_else(|| TokenMeshError::unknown_node(node_id))?;
    Ok(Json(node.status()?))
}

#[instrument(skip(state), level = "info")]
pub async fn fail_node(
    State(state): State<Arc<LocalCluster>>,
    Path(node_id): Path<u32>,
) -> Result<StatusCode> {
    state.fail(NodeId::new(node_id)).await?;
    event!(Level::INFO, node_id = node_id, "node failed through API");
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state), level = "info")]
pub async fn recover_node(
    State(state): State<Arc<LocalCluster>>,
    Path(node_id): Path<u32>,
) -> Result<StatusCode> {
    state.recover(NodeId::new(node_id)).await?;
    event!(Level::INFO, node_id = node_id, "node recovered through API");
    Ok(StatusCode::NO_CONTENT)
}
