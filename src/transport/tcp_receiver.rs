//! TCP Receiver
//!
//! Accepts peer connections and reads request frames. A request is acked as
//! soon as it decodes; the work it carries is handed to the node through a
//! channel so slow downstream relays never hold up the sender.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::messages::{read_frame, write_frame, PeerRequest, PeerResponse};
use crate::error::{Result, TransportError};

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub requests_received: AtomicU64,
    pub receive_errors: AtomicU64,
    pub decode_errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrozenReceiverStats {
    pub requests_received: u64,
    pub receive_errors: u64,
    pub decode_errors: u64,
}

impl ReceiverStats {
    pub fn freeze(&self) -> FrozenReceiverStats {
        FrozenReceiverStats {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct TcpReceiver {
    pub local_addr: SocketAddr,
    listener: Arc<TcpListener>,
    stats: Arc<ReceiverStats>,
    inbound_tx: mpsc::Sender<PeerRequest>,
}

impl TcpReceiver {
    pub async fn new(bind_addr: SocketAddr, inbound_tx: mpsc::Sender<PeerRequest>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            TransportError::Other(format!("Peer listener bind on {} failed: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            local_addr,
            listener: Arc::new(listener),
            stats: Arc::new(ReceiverStats::default()),
            inbound_tx,
        })
    }

    /// Start the accept loop
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let listener = self.listener.clone();
        let stats = self.stats.clone();
        let inbound_tx = self.inbound_tx.clone();

        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Peer accept failed: {}", e);
                        continue;
                    }
                };
                trace!("Peer connection from {}", peer_addr);
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_connection(
                    stream,
                    peer_addr,
                    stats.clone(),
                    inbound_tx.clone(),
                ));
            }
        })
    }

    pub fn get_stats(&self) -> FrozenReceiverStats {
        self.stats.freeze()
    }
}

/// Serve requests on one connection until the peer hangs up
async fn serve_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    stats: Arc<ReceiverStats>,
    inbound_tx: mpsc::Sender<PeerRequest>,
) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("Peer {} closed, receiver stats {:?}", peer_addr, stats.freeze());
                return;
            }
            Err(e) => {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping peer connection {}: {}", peer_addr, e);
                return;
            }
        };
        stats.requests_received.fetch_add(1, Ordering::Relaxed);

        let success = match PeerRequest::deserialize(&frame) {
            Ok(PeerRequest::Ping) => true,
            Ok(request) => inbound_tx.send(request).await.is_ok(),
            Err(e) => {
                stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Undecodable request from {}: {}", peer_addr, e);
                false
            }
        };

        let ack = match (PeerResponse::Ack { success }).serialize() {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Failed to encode ack: {}", e);
                return;
            }
        };
        if let Err(e) = write_frame(&mut stream, &ack).await {
            stats.receive_errors.fetch_add(1, Ordering::Relaxed);
            debug!("Failed to ack {}: {}", peer_addr, e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::node::messages::{Message, MsgId, SeenDigest};
    use crate::node::peers::PeerDirectory;
    use crate::transport::{TcpTransport, Transport};

    async fn receiver() -> (TcpReceiver, mpsc::Receiver<PeerRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let receiver = TcpReceiver::new("127.0.0.1:0".parse().unwrap(), tx)
            .await
            .unwrap();
        receiver.start();
        (receiver, rx)
    }

    #[tokio::test]
    async fn test_receiver_creation() {
        let (receiver, _rx) = receiver().await;
        assert_ne!(receiver.local_addr.port(), 0);
        assert_eq!(receiver.get_stats().requests_received, 0);
    }

    #[tokio::test]
    async fn test_requests_reach_channel_over_pooled_connection() {
        let (receiver, mut rx) = receiver().await;
        let directory = PeerDirectory::new(
            &"A".into(),
            vec![("B".into(), receiver.local_addr.to_string())],
        );
        let transport = TcpTransport::new(directory, Duration::from_secs(1));

        let message = Message {
            msg_id: MsgId::compute(&"A".into(), 1.0, b"hi"),
            topic: "chat".to_string(),
            content: "6869".to_string(),
            sender: "A".into(),
            timestamp: 1.0,
            lamport: 1,
        };
        transport.ping(&"B".into()).await.unwrap();
        transport.send_message(&"B".into(), &message).await.unwrap();
        transport
            .sync_seen_msgs(
                &"B".into(),
                &"A".into(),
                &SeenDigest::new(0.5, vec![message.msg_id]),
            )
            .await
            .unwrap();

        // Pings are acked without reaching the node
        match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
            Some(PeerRequest::SendMessage(got)) => assert_eq!(got, message),
            other => panic!("unexpected request: {:?}", other),
        }
        match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
            Some(PeerRequest::SyncSeenMsgs { sender, digest }) => {
                assert_eq!(sender, crate::node::NodeId::from("A"));
                assert_eq!(digest.horizon, 0.5);
                assert_eq!(digest.msg_ids, vec![message.msg_id]);
            }
            other => panic!("unexpected request: {:?}", other),
        }

        assert_eq!(receiver.get_stats().requests_received, 3);
        let stats = transport.stats().unwrap();
        assert_eq!(stats.acks_received, 3);
        assert_eq!(stats.connections_opened, 1);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_nacked() {
        let (receiver, _rx) = receiver().await;
        let mut stream = TcpStream::connect(receiver.local_addr).await.unwrap();
        write_frame(&mut stream, &[0xfe, 0x00]).await.unwrap();
        let ack = read_frame(&mut stream).await.unwrap();
        assert_eq!(
            PeerResponse::deserialize(&ack).unwrap(),
            PeerResponse::Ack { success: false }
        );
        assert_eq!(receiver.get_stats().decode_errors, 1);
    }
}
