use std::sync::Arc;

use axum::extract::State;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::cluster::LocalCluster;
use crate::settings::{APP_NAME, APP_VERSION};

// which part of the mesh this process runs
pub async fn root(State(cluster): State<Arc<LocalCluster>>) -> String {
    let local: Vec<String> = cluster
        .node_ids()
        .iter()
        .map(|id| id.to_string())
        .collect();
    format!(
        "Welcome to {}: nodes [{}] of a {}-node mesh",
        APP_NAME,
        local.join(", "),
        cluster.cluster_size()
    )
}

pub async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize, Deserialize)]
pub struct AboutResponse {
    name: String,
    version: String,
}

impl Default for AboutResponse {
    fn default() -> Self {
        Self {
            name: APP_NAME.to_string(),
            version: APP_VERSION.to_string(),
        }
    }
}

#[instrument]
pub async fn about() -> axum::Json<AboutResponse> {
    axum::Json(AboutResponse::default())
}
