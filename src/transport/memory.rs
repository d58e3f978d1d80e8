//! In-process transport
//!
//! Nodes register their `PeerService` with a shared `MemoryNetwork` and
//! requests are delivered by calling the service directly, so a publish has
//! fully propagated by the time it returns. Nodes can be marked down to
//! simulate a stopped process.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{PeerService, Transport};
use crate::config_error;
use crate::error::{Result, TransportError};
use crate::node::messages::{Message, MsgId, SeenDigest};
use crate::node::NodeId;

/// One `send_message` call observed on the network
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentMessage {
    pub from: NodeId,
    pub to: NodeId,
    pub msg_id: MsgId,
}

#[derive(Default)]
pub struct MemoryNetwork {
    services: RwLock<HashMap<NodeId, Weak<dyn PeerService>>>,
    down: RwLock<HashSet<NodeId>>,
    sent: Mutex<Vec<SentMessage>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that sends on this network as `local`
    pub fn transport(self: &Arc<Self>, local: impl Into<NodeId>) -> MemoryTransport {
        MemoryTransport {
            local: local.into(),
            network: self.clone(),
        }
    }

    pub fn register(&self, node_id: impl Into<NodeId>, service: Arc<dyn PeerService>) {
        self.services
            .write()
            .insert(node_id.into(), Arc::downgrade(&service));
    }

    pub fn set_down(&self, node_id: impl Into<NodeId>, down: bool) {
        let node_id = node_id.into();
        let mut set = self.down.write();
        if down {
            set.insert(node_id);
        } else {
            set.remove(&node_id);
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    fn lookup(&self, peer: &NodeId) -> Result<Arc<dyn PeerService>> {
        if self.down.read().contains(peer) {
            return Err(TransportError::Unavailable(format!("{} is down", peer)).into());
        }
        let weak = self
            .services
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| config_error!("No known address for peer {}", peer))?;
        weak.upgrade()
            .ok_or_else(|| TransportError::Unavailable(format!("{} has shut down", peer)).into())
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    local: NodeId,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    /// A down node can neither send nor receive
    fn check_local_up(&self) -> Result<()> {
        if self.network.down.read().contains(&self.local) {
            return Err(TransportError::Unavailable(format!("{} is down", self.local)).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_message(&self, peer: &NodeId, message: &Message) -> Result<()> {
        self.check_local_up()?;
        let service = self.network.lookup(peer)?;
        self.network.sent.lock().push(SentMessage {
            from: self.local.clone(),
            to: peer.clone(),
            msg_id: message.msg_id,
        });
        service.on_message(message.clone()).await;
        Ok(())
    }

    async fn sync_seen_msgs(
        &self,
        peer: &NodeId,
        sender: &NodeId,
        digest: &SeenDigest,
    ) -> Result<()> {
        self.check_local_up()?;
        let service = self.network.lookup(peer)?;
        service.on_seen_msgs(sender.clone(), digest.clone()).await;
        Ok(())
    }

    async fn ping(&self, peer: &NodeId) -> Result<()> {
        self.check_local_up()?;
        self.network.lookup(peer).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<MsgId>>,
        syncs: Mutex<Vec<(NodeId, usize)>>,
    }

    #[async_trait]
    impl PeerService for Recorder {
        async fn on_message(&self, message: Message) {
            self.messages.lock().push(message.msg_id);
        }

        async fn on_seen_msgs(&self, sender: NodeId, digest: SeenDigest) {
            self.syncs.lock().push((sender, digest.msg_ids.len()));
        }
    }

    fn message() -> Message {
        Message {
            msg_id: MsgId::compute(&"A".into(), 1.0, b"x"),
            topic: "chat".to_string(),
            content: "78".to_string(),
            sender: "A".into(),
            timestamp: 1.0,
            lamport: 1,
        }
    }

    #[tokio::test]
    async fn test_delivery_and_down_nodes() {
        let network = MemoryNetwork::new();
        let recorder = Arc::new(Recorder::default());
        network.register("B", recorder.clone());
        let transport = network.transport("A");

        transport.send_message(&"B".into(), &message()).await.unwrap();
        transport
            .sync_seen_msgs(
                &"B".into(),
                &"A".into(),
                &SeenDigest::new(0.0, vec![message().msg_id]),
            )
            .await
            .unwrap();
        assert_eq!(recorder.messages.lock().len(), 1);
        assert_eq!(recorder.syncs.lock()[0], (NodeId::from("A"), 1));
        assert_eq!(network.sent().len(), 1);

        network.set_down("B", true);
        let err = transport.ping(&"B".into()).await.unwrap_err();
        assert!(err.is_unavailable());

        network.set_down("B", false);
        assert!(transport.ping(&"B".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_and_dropped_peers() {
        let network = MemoryNetwork::new();
        let transport = network.transport("A");
        let err = transport.ping(&"Z".into()).await.unwrap_err();
        assert!(!err.is_unavailable());

        let recorder: Arc<dyn PeerService> = Arc::new(Recorder::default());
        network.register("B", recorder.clone());
        drop(recorder);
        assert!(transport.ping(&"B".into()).await.unwrap_err().is_unavailable());
    }
}
