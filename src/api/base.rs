use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::node::{DeliveryCoordinator, NodeId};
use crate::settings::{PubSubMode, APP_NAME, APP_VERSION};

pub async fn root() -> &'static str {
    "Welcome to Starling"
}

pub async fn health() -> &'static str {
    "OK"
}

/// Build identity plus what this node is allowed to do
#[derive(Debug, Serialize, Deserialize)]
pub struct AboutResponse {
    pub name: String,
    pub version: String,
    pub node_id: NodeId,
    pub publisher: bool,
    pub subscriber: bool,
    pub mode: PubSubMode,
    pub supported_modes: Vec<PubSubMode>,
}

impl AboutResponse {
    pub fn for_node(node: &DeliveryCoordinator) -> Self {
        let roles = node.roles();
        Self {
            name: APP_NAME.to_string(),
            version: APP_VERSION.to_string(),
            node_id: node.node_id().clone(),
            publisher: roles.publisher,
            subscriber: roles.subscriber,
            mode: node.mode(),
            supported_modes: vec![PubSubMode::Gossip, PubSubMode::Leader],
        }
    }
}

#[instrument(skip(state))]
pub async fn about(State(state): State<Arc<DeliveryCoordinator>>) -> Json<AboutResponse> {
    Json(AboutResponse::for_node(&state))
}
