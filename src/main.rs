use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use starling::api;
use starling::cli;
use starling::node::{DeliveryCoordinator, Node};
use starling::transport::{TcpReceiver, TcpTransport};

// Inbound peer requests waiting for the node loop
const INBOUND_QUEUE_SIZE: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "starling=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings()?;
    let http_address = settings.http_listen_addr()?;
    let peer_address = settings.peer_listen_addr()?;

    // Peer transport: receiver feeds the node loop, sender reaches the directory
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
    let receiver = TcpReceiver::new(peer_address, inbound_tx).await?;
    receiver.start();
    let transport = Arc::new(TcpTransport::new(
        settings.peer_directory(),
        settings.rpc_timeout(),
    ));

    let coordinator = Arc::new(DeliveryCoordinator::builder(settings.clone(), transport).build()?);
    let node = Node::new(coordinator.clone(), &settings);
    tokio::spawn(node.run(inbound_rx));

    // Build Axum Router
    let api = api::api(coordinator).await?;

    info!(
        "[{}] Starting Starling: HTTP on {}, peers on {} (mode {})",
        settings.node_id, http_address, receiver.local_addr, settings.mode
    );
    axum::Server::bind(&http_address)
        .serve(api.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!(
        "[{}] Stopped, peer receiver stats {:?}",
        settings.node_id,
        receiver.get_stats()
    );
    Ok(())
}
