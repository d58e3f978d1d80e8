//! TCP sender with a per-peer connection pool
//!
//! Each request is one length-prefixed frame answered by one ack frame.
//! Connections are kept for reuse after a clean exchange; a pooled
//! connection that fails is dropped and the request retried once on a
//! fresh connection.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::messages::{read_frame, write_frame, PeerRequest, PeerResponse};
use super::Transport;
use crate::error::{Result, TransportError};
use crate::node::messages::{Message, SeenDigest};
use crate::node::peers::PeerDirectory;
use crate::node::NodeId;

const MAX_IDLE_PER_PEER: usize = 4;
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct PooledConnection {
    stream: TcpStream,
    last_used: Instant,
}

impl PooledConnection {
    fn is_expired(&self) -> bool {
        self.last_used.elapsed() > IDLE_TIMEOUT
    }
}

#[derive(Debug, Default)]
pub struct TcpTransportStats {
    pub requests_sent: AtomicU64,
    pub acks_received: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connection_errors: AtomicU64,
    pub timeout_errors: AtomicU64,
}

/// Point-in-time copy of the outbound counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub acks_received: u64,
    pub connections_opened: u64,
    pub connection_errors: u64,
    pub timeout_errors: u64,
}

impl TcpTransportStats {
    pub fn freeze(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            timeout_errors: self.timeout_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct TcpTransport {
    directory: PeerDirectory,
    rpc_timeout: Duration,
    idle: Mutex<HashMap<NodeId, Vec<PooledConnection>>>,
    stats: Arc<TcpTransportStats>,
}

impl TcpTransport {
    pub fn new(directory: PeerDirectory, rpc_timeout: Duration) -> Self {
        Self {
            directory,
            rpc_timeout,
            idle: Mutex::new(HashMap::new()),
            stats: Arc::new(TcpTransportStats::default()),
        }
    }

    fn checkout(&self, peer: &NodeId) -> Option<TcpStream> {
        let mut idle = self.idle.lock();
        let pool = idle.get_mut(peer)?;
        pool.retain(|conn| !conn.is_expired());
        pool.pop().map(|conn| conn.stream)
    }

    fn checkin(&self, peer: &NodeId, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let pool = idle.entry(peer.clone()).or_default();
        if pool.len() < MAX_IDLE_PER_PEER {
            pool.push(PooledConnection {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// One request/ack exchange bounded by the RPC timeout
    async fn call(&self, peer: &NodeId, request: PeerRequest) -> Result<()> {
        let address = self.directory.address(peer)?.to_string();
        let data = request.serialize()?;
        self.stats.requests_sent.fetch_add(1, Ordering::Relaxed);

        match timeout(self.rpc_timeout, self.exchange(peer, &address, &data)).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.timeout_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Unavailable(format!(
                    "{} ({}) did not answer {} within {:?}",
                    peer,
                    address,
                    request.kind(),
                    self.rpc_timeout
                ))
                .into())
            }
        }
    }

    async fn exchange(&self, peer: &NodeId, address: &str, data: &[u8]) -> Result<()> {
        if let Some(mut stream) = self.checkout(peer) {
            match round_trip(&mut stream, data).await {
                Ok(response) => return self.finish(peer, stream, &response),
                Err(e) => debug!("Pooled connection to {} failed, reconnecting: {}", peer, e),
            }
        }

        let mut stream = TcpStream::connect(address).await.map_err(|e| {
            self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
            TransportError::Unavailable(format!("connect to {} ({}): {}", peer, address, e))
        })?;
        self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
        let _ = stream.set_nodelay(true);

        let response = round_trip(&mut stream, data).await.map_err(|e| {
            self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
            TransportError::Unavailable(format!("exchange with {} ({}): {}", peer, address, e))
        })?;
        self.finish(peer, stream, &response)
    }

    fn finish(&self, peer: &NodeId, stream: TcpStream, response: &[u8]) -> Result<()> {
        let response = PeerResponse::deserialize(response).map_err(|e| {
            TransportError::Other(format!("invalid response from {}: {}", peer, e))
        })?;
        self.stats.acks_received.fetch_add(1, Ordering::Relaxed);
        match response {
            PeerResponse::Ack { success: true } => {
                self.checkin(peer, stream);
                Ok(())
            }
            PeerResponse::Ack { success: false } => {
                self.checkin(peer, stream);
                Err(TransportError::Other(format!("{} rejected the request", peer)).into())
            }
        }
    }
}

async fn round_trip(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<Vec<u8>> {
    write_frame(stream, data).await?;
    read_frame(stream).await
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_message(&self, peer: &NodeId, message: &Message) -> Result<()> {
        self.call(peer, PeerRequest::SendMessage(message.clone()))
            .await
    }

    async fn sync_seen_msgs(
        &self,
        peer: &NodeId,
        sender: &NodeId,
        digest: &SeenDigest,
    ) -> Result<()> {
        self.call(
            peer,
            PeerRequest::SyncSeenMsgs {
                sender: sender.clone(),
                digest: digest.clone(),
            },
        )
        .await
    }

    async fn ping(&self, peer: &NodeId) -> Result<()> {
        self.call(peer, PeerRequest::Ping).await
    }

    fn stats(&self) -> Option<TransportStats> {
        Some(self.stats.freeze())
    }
}
