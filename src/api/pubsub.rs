use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};

use crate::api_error;
use crate::error::Result;
use crate::node::messages::{PublishReceipt, StatusResponse};
use crate::node::{DeliveryCoordinator, NodeId};
use crate::settings::PubSubMode;

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TopicRequest {
    pub topic: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriptionsResponse {
    pub node_id: NodeId,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchModeRequest {
    pub mode: PubSubMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchModeResponse {
    pub node_id: NodeId,
    pub previous: PubSubMode,
    pub mode: PubSubMode,
}

fn require_topic(topic: &str) -> Result<&str> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(api_error!("topic must not be empty"));
    }
    Ok(topic)
}

#[instrument(skip(state, request), fields(topic = %request.topic), level = "debug")]
pub async fn publish(
    State(state): State<Arc<DeliveryCoordinator>>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<PublishReceipt>> {
    let topic = require_topic(&request.topic)?;
    let receipt = state
        .publish(topic, request.message.as_bytes())
        .await
        .map_err(|err| {
            event!(
                Level::ERROR,
                message = "Failed publishing",
                err = format!("{:?}", err)
            );
            err
        })?;
    Ok(Json(receipt))
}

#[instrument(skip(state), level = "debug")]
pub async fn subscribe(
    State(state): State<Arc<DeliveryCoordinator>>,
    Json(request): Json<TopicRequest>,
) -> Result<Json<SubscriptionsResponse>> {
    let subscriptions = state.subscribe(require_topic(&request.topic)?)?;
    Ok(Json(SubscriptionsResponse {
        node_id: state.node_id().clone(),
        subscriptions,
    }))
}

#[instrument(skip(state), level = "debug")]
pub async fn unsubscribe(
    State(state): State<Arc<DeliveryCoordinator>>,
    Json(request): Json<TopicRequest>,
) -> Result<Json<SubscriptionsResponse>> {
    let subscriptions = state.unsubscribe(require_topic(&request.topic)?);
    Ok(Json(SubscriptionsResponse {
        node_id: state.node_id().clone(),
        subscriptions,
    }))
}

#[instrument(skip(state), level = "debug")]
pub async fn status(State(state): State<Arc<DeliveryCoordinator>>) -> Json<StatusResponse> {
    Json(state.status())
}

#[instrument(skip(state), level = "debug")]
pub async fn switch_mode(
    State(state): State<Arc<DeliveryCoordinator>>,
    Json(request): Json<SwitchModeRequest>,
) -> Json<SwitchModeResponse> {
    let previous = state.switch_mode(request.mode);
    event!(
        Level::INFO,
        message = "Mode switch requested",
        previous = %previous,
        mode = %request.mode
    );
    Json(SwitchModeResponse {
        node_id: state.node_id().clone(),
        previous,
        mode: request.mode,
    })
}
