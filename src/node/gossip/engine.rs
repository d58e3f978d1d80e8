//! Flooding and anti-entropy over the peer transport.
//!
//! Every outbound call reports its outcome to the failure detector.
//! Unavailable peers are skipped for the round; a missing peer address is a
//! configuration error and is returned to the caller.
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use super::selection::PeerSelector;
use super::store::MessageStore;
use crate::error::{Result, StarlingError};
use crate::node::liveness::FailureDetector;
use crate::node::messages::{Message, MsgId, SeenDigest};
use crate::node::NodeId;
use crate::transport::Transport;

pub struct GossipEngine {
    local: NodeId,
    peers: Vec<NodeId>,
    transport: Arc<dyn Transport>,
    detector: Arc<FailureDetector>,
    selector: Box<dyn PeerSelector>,
    store: Mutex<MessageStore>,
}

impl GossipEngine {
    pub fn new(
        local: NodeId,
        peers: Vec<NodeId>,
        transport: Arc<dyn Transport>,
        detector: Arc<FailureDetector>,
        selector: Box<dyn PeerSelector>,
        capacity: usize,
    ) -> Self {
        Self {
            local,
            peers,
            transport,
            detector,
            selector,
            store: Mutex::new(MessageStore::new(capacity)),
        }
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    /// Atomically check and mark the message seen, storing its body.
    /// Returns true the first time a message id is recorded; false for
    /// duplicates and for messages older than the eviction horizon.
    pub fn record(&self, message: &Message) -> bool {
        self.store.lock().insert(message)
    }

    /// Restore a seen id without a body
    pub fn mark_seen(&self, msg_id: MsgId, timestamp: Option<f64>) -> bool {
        self.store.lock().mark_seen(msg_id, timestamp)
    }

    /// Restore the eviction horizon
    pub fn raise_horizon(&self, horizon: f64) {
        self.store.lock().raise_horizon(horizon);
    }

    pub fn has_seen(&self, msg_id: &MsgId) -> bool {
        self.store.lock().contains(msg_id)
    }

    pub fn seen_count(&self) -> usize {
        self.store.lock().len()
    }

    pub fn horizon(&self) -> f64 {
        self.store.lock().horizon()
    }

    pub fn digest(&self) -> SeenDigest {
        self.store.lock().digest()
    }

    /// Horizon and held ids with timestamps, read under one lock
    pub fn retained(&self) -> (f64, Vec<(MsgId, Option<f64>)>) {
        let store = self.store.lock();
        (store.horizon(), store.retained())
    }

    pub fn stored(&self, msg_id: &MsgId) -> Option<Message> {
        self.store.lock().get(msg_id).cloned()
    }

    /// Record and flood. A message that was already seen is not sent again.
    /// Returns whether the message was new.
    pub async fn broadcast(&self, message: &Message, fanout: usize) -> Result<bool> {
        if !self.record(message) {
            trace!("[{}] Already seen {:?}, not broadcasting", self.local, message.msg_id);
            return Ok(false);
        }
        self.flood(message, fanout).await?;
        Ok(true)
    }

    /// Send to `fanout` selected peers without consulting the seen set.
    /// Used to relay messages that were recorded on receipt.
    pub async fn flood(&self, message: &Message, fanout: usize) -> Result<()> {
        let targets = self.selector.select(&self.peers, fanout);
        debug!(
            "[{}] Gossip {:?} to {:?}",
            self.local, message.msg_id, targets
        );
        self.send_all(&targets, message).await
    }

    /// Send to every peer in `targets` concurrently
    pub async fn send_all(&self, targets: &[NodeId], message: &Message) -> Result<()> {
        let mut sends = JoinSet::new();
        for peer in targets {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let message = message.clone();
            sends.spawn(async move {
                let result = transport.send_message(&peer, &message).await;
                (peer, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((peer, result)) => {
                    if let Err(e) = self.settle(&peer, result) {
                        first_error.get_or_insert(e);
                    }
                }
                Err(e) => warn!("[{}] Send task failed: {}", self.local, e),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn send(&self, peer: &NodeId, message: &Message) -> Result<()> {
        let result = self.transport.send_message(peer, message).await;
        self.settle(peer, result)
    }

    /// Report an outcome to the detector and decide whether it matters to
    /// the caller
    fn settle(&self, peer: &NodeId, result: Result<()>) -> Result<()> {
        self.detector.record_result(peer, &result);
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_unavailable() => {
                trace!("[{}] Skipping unavailable peer {}: {}", self.local, peer, e);
                Ok(())
            }
            Err(e @ StarlingError::Config(_)) => Err(e),
            Err(e) => {
                warn!("[{}] Send to {} failed: {}", self.local, peer, e);
                Ok(())
            }
        }
    }

    /// Anti-entropy push: offer our seen digest to every peer
    pub async fn push_seen_msgs(&self) -> Result<()> {
        let digest = self.digest();
        let mut pushes = JoinSet::new();
        for peer in &self.peers {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let local = self.local.clone();
            let digest = digest.clone();
            pushes.spawn(async move {
                let result = transport.sync_seen_msgs(&peer, &local, &digest).await;
                (peer, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((peer, result)) => {
                    if let Err(e) = self.settle(&peer, result) {
                        first_error.get_or_insert(e);
                    }
                }
                Err(e) => warn!("[{}] Sync task failed: {}", self.local, e),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Anti-entropy pull side: resend to `peer` whatever it lacks and could
    /// still accept. Messages at or below its horizon are skipped, as are
    /// ids we hold no body for. Stops at the first send that finds the peer
    /// unavailable.
    pub async fn on_receive_seen_msgs(&self, peer: &NodeId, digest: SeenDigest) -> Result<()> {
        let theirs: HashSet<MsgId> = digest.msg_ids.iter().copied().collect();
        let (missing, unknown) = {
            let store = self.store.lock();
            let mut missing = Vec::new();
            let mut unknown = Vec::new();
            for msg_id in store.missing_from(&theirs) {
                match store.get(&msg_id) {
                    Some(message) if digest.retains(message) => missing.push(message.clone()),
                    Some(_) => {}
                    None => unknown.push(msg_id),
                }
            }
            (missing, unknown)
        };
        for msg_id in &unknown {
            warn!(
                "[{}] {} lacks {:?} but no body is stored here",
                self.local, peer, msg_id
            );
        }
        if missing.is_empty() {
            return Ok(());
        }
        debug!(
            "[{}] Resending {} messages missing at {}",
            self.local,
            missing.len(),
            peer
        );
        for message in missing {
            let result = self.transport.send_message(peer, &message).await;
            let unavailable = matches!(&result, Err(e) if e.is_unavailable());
            self.settle(peer, result)?;
            if unavailable {
                break;
            }
        }
        Ok(())
    }
}
