//! Peer transport
//!
//! Three request kinds travel between nodes: a gossiped message, an
//! anti-entropy push of seen message ids, and a liveness ping. Every request
//! is answered with an ack. Transports classify failures so callers can tell
//! an unreachable peer (`TransportError::Unavailable`) from anything else.
pub mod memory;
pub mod messages;
pub mod tcp;
pub mod tcp_receiver;

use async_trait::async_trait;

use crate::error::Result;
use crate::node::messages::{Message, SeenDigest};
use crate::node::NodeId;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use messages::{PeerRequest, PeerResponse};
pub use tcp::{TcpTransport, TransportStats};
pub use tcp_receiver::TcpReceiver;

/// Outbound side: how a node reaches its peers
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, peer: &NodeId, message: &Message) -> Result<()>;

    async fn sync_seen_msgs(&self, peer: &NodeId, sender: &NodeId, digest: &SeenDigest)
        -> Result<()>;

    async fn ping(&self, peer: &NodeId) -> Result<()>;

    /// Outbound counters, for transports that keep them
    fn stats(&self) -> Option<TransportStats> {
        None
    }
}

/// Inbound side: what a node does with requests from its peers
#[async_trait]
pub trait PeerService: Send + Sync {
    async fn on_message(&self, message: Message);

    async fn on_seen_msgs(&self, sender: NodeId, digest: SeenDigest);
}

/// Hand a decoded request to the service. Pings carry no work.
pub async fn dispatch(service: &dyn PeerService, request: PeerRequest) {
    match request {
        PeerRequest::SendMessage(message) => service.on_message(message).await,
        PeerRequest::SyncSeenMsgs { sender, digest } => {
            service.on_seen_msgs(sender, digest).await
        }
        PeerRequest::Ping => {}
    }
}
