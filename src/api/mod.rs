mod base;
mod pubsub;

use std::borrow::Cow;
use std::sync::Arc;

use axum::{
    error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse, routing, Router,
};
use tokio::time::Duration;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub mod paths;

pub use base::AboutResponse;
pub use pubsub::{
    PublishRequest, SubscriptionsResponse, SwitchModeRequest, SwitchModeResponse, TopicRequest,
};

use crate::error::Result;
use crate::node::DeliveryCoordinator;

/// Build the control-plane API around a node's coordinator
pub async fn api(node: Arc<DeliveryCoordinator>) -> Result<Router> {
    let api = Router::new()
        .route(paths::base::ROOT, routing::get(base::root))
        .route(paths::base::HEALTH, routing::get(base::health))
        .route(paths::base::ABOUT, routing::get(base::about))
        .route(paths::pubsub::PUBLISH, routing::post(pubsub::publish))
        .route(paths::pubsub::SUBSCRIBE, routing::post(pubsub::subscribe))
        .route(paths::pubsub::UNSUBSCRIBE, routing::post(pubsub::unsubscribe))
        .route(paths::pubsub::STATUS, routing::get(pubsub::status))
        .route(paths::pubsub::SWITCH_MODE, routing::post(pubsub::switch_mode))
        .layer(
            ServiceBuilder::new()
                // Handle errors from middleware
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .timeout(Duration::from_secs(10)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(node);

    Ok(api)
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }

    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}
