//! Publish and receive paths for one node.
//!
//! The coordinator owns all per-node state: message store (through the
//! gossip engine), Lamport clock, leader state, liveness table,
//! subscriptions and the optional on-disk log. Every inbound message passes
//! the dedup gate first; a message id that was already seen stops here,
//! which is what terminates both the gossip flood and the leader relay.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::crypto::Cipher;
use crate::error::{Result, StarlingError};
use crate::node::clock::LamportClock;
use crate::node::gossip::{GossipEngine, PeerSelector, RandomSelector};
use crate::node::leader::LeaderElector;
use crate::node::liveness::{FailureDetector, LivenessObserver, PeerState, TracingObserver};
use crate::node::messages::{
    Delivery, Message, MsgId, PeerStatus, PublishReceipt, SeenDigest, StatusResponse,
};
use crate::node::peers::PeerDirectory;
use crate::node::persistence::{NodeStorage, SeenSnapshot};
use crate::node::topics::{DeliveryHandler, LocalSubscriber, LogDeliveryHandler, TopicRegistry};
use crate::node::NodeId;
use crate::settings::{PubSubMode, Settings};
use crate::transport::{PeerService, Transport};
use crate::role_error;

/// Seconds since the epoch with sub-second precision
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Roles {
    pub publisher: bool,
    pub subscriber: bool,
}

pub struct DeliveryCoordinator {
    node_id: NodeId,
    roles: Roles,
    fanout: usize,
    directory: PeerDirectory,
    clock: LamportClock,
    transport: Arc<dyn Transport>,
    gossip: Arc<GossipEngine>,
    detector: Arc<FailureDetector>,
    elector: LeaderElector,
    cipher: Arc<dyn Cipher>,
    registry: Mutex<TopicRegistry>,
    subscriber: LocalSubscriber,
    storage: Option<Arc<NodeStorage>>,
}

/// Assembles a coordinator from settings. Strategies default to random
/// peer selection, log-line liveness events and log-line deliveries.
pub struct CoordinatorBuilder {
    settings: Settings,
    transport: Arc<dyn Transport>,
    selector: Option<Box<dyn PeerSelector>>,
    observer: Option<Arc<dyn LivenessObserver>>,
    handler: Option<Arc<dyn DeliveryHandler>>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl CoordinatorBuilder {
    pub fn selector(mut self, selector: impl PeerSelector + 'static) -> Self {
        self.selector = Some(Box::new(selector));
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LivenessObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn build(self) -> Result<DeliveryCoordinator> {
        let settings = self.settings;
        settings.validate()?;

        let node_id = settings.node_id.clone();
        let directory = settings.peer_directory();
        let peers = directory.ids();

        let cipher = match self.cipher {
            Some(cipher) => cipher,
            None => {
                if settings.cluster_key.is_none() {
                    warn!("[{}] No cluster key configured, payloads travel unencrypted", node_id);
                }
                settings.cipher()?
            }
        };

        let detector = Arc::new(FailureDetector::new(
            node_id.clone(),
            &peers,
            self.transport.clone(),
            self.observer.unwrap_or_else(|| Arc::new(TracingObserver)),
        ));
        let gossip = Arc::new(GossipEngine::new(
            node_id.clone(),
            peers.clone(),
            self.transport.clone(),
            detector.clone(),
            self.selector.unwrap_or_else(|| Box::new(RandomSelector)),
            settings.seen_capacity,
        ));
        let elector = LeaderElector::new(node_id.clone(), peers, detector.clone(), settings.mode);
        let storage = settings
            .data_dir
            .as_deref()
            .map(|dir| NodeStorage::open(dir, settings.seen_capacity))
            .transpose()?
            .map(Arc::new);

        let coordinator = DeliveryCoordinator {
            subscriber: LocalSubscriber::new(
                node_id.clone(),
                self.handler.unwrap_or_else(|| Arc::new(LogDeliveryHandler)),
            ),
            node_id,
            roles: Roles {
                publisher: settings.is_publisher,
                subscriber: settings.is_subscriber,
            },
            fanout: settings.gossip_fanout,
            directory,
            clock: LamportClock::new(),
            transport: self.transport,
            gossip,
            detector,
            elector,
            cipher,
            registry: Mutex::new(TopicRegistry::new()),
            storage,
        };
        coordinator.restore(&settings)?;
        Ok(coordinator)
    }
}

impl DeliveryCoordinator {
    pub fn builder(settings: Settings, transport: Arc<dyn Transport>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            settings,
            transport,
            selector: None,
            observer: None,
            handler: None,
            cipher: None,
        }
    }

    /// Reload persisted state, then apply startup topics
    fn restore(&self, settings: &Settings) -> Result<()> {
        let mut topics = Vec::new();
        if let Some(storage) = &self.storage {
            let snapshot = storage.seen_log.load(settings.seen_capacity)?;
            self.gossip.raise_horizon(snapshot.horizon);
            let restored = snapshot
                .entries
                .into_iter()
                .filter(|(id, timestamp)| self.gossip.mark_seen(*id, *timestamp))
                .count();
            if restored > 0 {
                info!("[{}] Restored {} seen message ids", self.node_id, restored);
            }
            topics = storage.subscriptions.load()?;
        }
        topics.extend(settings.initial_topics.iter().cloned());

        if !topics.is_empty() && !self.roles.subscriber {
            warn!("[{}] Not a subscriber, ignoring startup topics {:?}", self.node_id, topics);
            return Ok(());
        }
        for topic in topics {
            self.subscribe(&topic)?;
        }
        Ok(())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn roles(&self) -> Roles {
        self.roles
    }

    pub fn lamport(&self) -> u64 {
        self.clock.current()
    }

    pub fn mode(&self) -> PubSubMode {
        self.elector.mode()
    }

    pub fn leader_id(&self) -> NodeId {
        self.elector.leader_id()
    }

    pub fn has_seen(&self, msg_id: &MsgId) -> bool {
        self.gossip.has_seen(msg_id)
    }

    pub fn stored(&self, msg_id: &MsgId) -> Option<Message> {
        self.gossip.stored(msg_id)
    }

    pub fn seen_count(&self) -> usize {
        self.gossip.seen_count()
    }

    pub fn delivered_count(&self) -> u64 {
        self.subscriber.delivered_count()
    }

    /// Mark seen, store, append to the seen log. False if already seen or
    /// older than the eviction horizon.
    async fn record(&self, message: &Message) -> bool {
        if !self.gossip.record(message) {
            return false;
        }
        if let Some(storage) = &self.storage {
            let storage = storage.clone();
            let gossip = self.gossip.clone();
            let (msg_id, timestamp) = (message.msg_id, message.timestamp);
            let written = tokio::task::spawn_blocking(move || -> Result<()> {
                storage.seen_log.append(&msg_id, timestamp)?;
                if storage.seen_log.needs_compaction() {
                    storage.seen_log.compact(|| {
                        let (horizon, entries) = gossip.retained();
                        SeenSnapshot { horizon, entries }
                    })?;
                }
                Ok(())
            })
            .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[{}] Failed to write seen log: {}", self.node_id, e),
                Err(e) => warn!("[{}] Seen log task failed: {}", self.node_id, e),
            }
        }
        true
    }

    fn deliver_local(&self, message: &Message, plaintext: &[u8], lamport: u64) {
        let delivery = Delivery::new(message, plaintext, lamport, now_secs());
        let registry = self.registry.lock();
        self.subscriber.receive(&registry, &delivery);
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<PublishReceipt> {
        if !self.roles.publisher {
            return Err(role_error!("{} is not a publisher", self.node_id));
        }
        let lamport = self.clock.tick().ok_or_else(|| {
            StarlingError::Clock(format!("{} cannot tick past {}", self.node_id, u64::MAX))
        })?;
        let timestamp = now_secs();
        let msg_id = MsgId::compute(&self.node_id, timestamp, payload);
        let message = Message {
            msg_id,
            topic: topic.to_string(),
            content: self.cipher.encrypt(payload)?,
            sender: self.node_id.clone(),
            timestamp,
            lamport,
        };
        self.record(&message).await;

        let mode = self.elector.mode();
        info!(
            "[{}] Publishing {:?} | Topic: {} | Lamport: {} | Mode: {}",
            self.node_id, msg_id, topic, lamport, mode
        );
        match mode {
            PubSubMode::Gossip => self.gossip.flood(&message, self.fanout).await?,
            PubSubMode::Leader if self.elector.is_leader() => {
                self.gossip.send_all(self.gossip.peers(), &message).await?;
                if self.roles.subscriber {
                    self.deliver_local(&message, payload, lamport);
                }
            }
            PubSubMode::Leader => {
                let leader = self.elector.leader_id();
                debug!("[{}] Forwarding {:?} to leader {}", self.node_id, msg_id, leader);
                self.gossip.send(&leader, &message).await?;
            }
        }

        Ok(PublishReceipt {
            msg_id,
            lamport,
            mode,
        })
    }

    pub async fn receive(&self, message: Message) -> Result<()> {
        if !self.roles.subscriber {
            trace!("[{}] Not a subscriber, ignoring {:?}", self.node_id, message.msg_id);
            return Ok(());
        }
        if message.lamport == u64::MAX {
            warn!(
                "[{}] Dropping {:?} from {}: Lamport time {} leaves no room to advance",
                self.node_id, message.msg_id, message.sender, message.lamport
            );
            return Ok(());
        }
        if !self.record(&message).await {
            trace!("[{}] Duplicate or expired {:?} dropped", self.node_id, message.msg_id);
            return Ok(());
        }

        let Some(lamport) = self.clock.observe(message.lamport) else {
            warn!(
                "[{}] Lamport clock exhausted, not delivering {:?}",
                self.node_id, message.msg_id
            );
            return Ok(());
        };
        match self.cipher.decrypt(&message.content) {
            Ok(plaintext) => self.deliver_local(&message, &plaintext, lamport),
            Err(e) => warn!(
                "[{}] Cannot decrypt {:?} from {}: {}",
                self.node_id, message.msg_id, message.sender, e
            ),
        }

        match self.elector.mode() {
            PubSubMode::Gossip => self.gossip.flood(&message, self.fanout).await,
            PubSubMode::Leader if self.elector.is_leader() && message.sender != self.node_id => {
                let targets: Vec<NodeId> = self
                    .gossip
                    .peers()
                    .iter()
                    .filter(|peer| **peer != message.sender)
                    .cloned()
                    .collect();
                debug!(
                    "[{}] Leader relaying {:?} to {:?}",
                    self.node_id, message.msg_id, targets
                );
                self.gossip.send_all(&targets, &message).await
            }
            PubSubMode::Leader => Ok(()),
        }
    }

    pub async fn on_receive_seen_msgs(&self, peer: &NodeId, digest: SeenDigest) -> Result<()> {
        self.gossip.on_receive_seen_msgs(peer, digest).await
    }

    pub async fn push_seen_msgs(&self) -> Result<()> {
        self.gossip.push_seen_msgs().await
    }

    pub async fn check_leader(&self) -> Option<NodeId> {
        self.elector.check_leader().await
    }

    pub fn subscribe(&self, topic: &str) -> Result<Vec<String>> {
        if !self.roles.subscriber {
            return Err(role_error!("{} is not a subscriber", self.node_id));
        }
        let added = self.registry.lock().subscribe(topic, &self.node_id);
        if added {
            info!("[{}] Subscribed to topic: '{}'", self.node_id, topic);
            self.save_subscriptions();
        }
        Ok(self.subscriptions())
    }

    pub fn unsubscribe(&self, topic: &str) -> Vec<String> {
        if !self.roles.subscriber {
            return Vec::new();
        }
        let removed = self.registry.lock().unsubscribe(topic, &self.node_id);
        if removed {
            info!("[{}] Unsubscribed from topic: '{}'", self.node_id, topic);
            self.save_subscriptions();
        }
        self.subscriptions()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.registry.lock().topics_for(&self.node_id)
    }

    fn save_subscriptions(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.subscriptions.save(&self.subscriptions()) {
                warn!("[{}] Failed to save subscriptions: {}", self.node_id, e);
            }
        }
    }

    pub fn switch_mode(&self, mode: PubSubMode) -> PubSubMode {
        self.elector.set_mode(mode)
    }

    pub fn status(&self) -> StatusResponse {
        let leader = self.elector.state();
        let liveness = self.detector.snapshot();
        let peers = self
            .directory
            .iter()
            .map(|(node_id, address)| {
                let (state, age) = liveness
                    .get(node_id)
                    .copied()
                    .unwrap_or((PeerState::Unknown, Duration::ZERO));
                PeerStatus {
                    node_id: node_id.clone(),
                    address: address.to_string(),
                    state,
                    state_age_secs: age.as_secs_f64(),
                }
            })
            .collect();
        let horizon = self.gossip.horizon();
        StatusResponse {
            node_id: self.node_id.clone(),
            subscriptions: self.subscriptions(),
            leader_id: leader.leader_id,
            mode: leader.mode,
            lamport: self.clock.current(),
            seen_count: self.gossip.seen_count(),
            seen_horizon: horizon.is_finite().then_some(horizon),
            peers,
            transport: self.transport.stats(),
        }
    }
}

#[async_trait]
impl PeerService for DeliveryCoordinator {
    async fn on_message(&self, message: Message) {
        if let Err(e) = self.receive(message).await {
            warn!("[{}] Receive failed: {}", self.node_id, e);
        }
    }

    async fn on_seen_msgs(&self, sender: NodeId, digest: SeenDigest) {
        if let Err(e) = self.on_receive_seen_msgs(&sender, digest).await {
            warn!("[{}] Anti-entropy with {} failed: {}", self.node_id, sender, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StarlingError;
    use crate::node::gossip::FixedSelector;
    use crate::node::topics::CollectingHandler;
    use crate::transport::MemoryNetwork;

    fn settings(id: &str, peers: &[&str]) -> Settings {
        let mut settings = Settings::new(id);
        settings.peers = peers.iter().map(|p| p.parse().unwrap()).collect();
        settings
    }

    fn lone_node(settings: Settings) -> (DeliveryCoordinator, Arc<CollectingHandler>) {
        let network = MemoryNetwork::new();
        let handler = Arc::new(CollectingHandler::default());
        let transport = Arc::new(network.transport(settings.node_id.clone()));
        let coordinator = DeliveryCoordinator::builder(settings, transport)
            .selector(FixedSelector)
            .handler(handler.clone())
            .build()
            .unwrap();
        (coordinator, handler)
    }

    fn foreign_message(lamport: u64) -> Message {
        stamped_message(5.0, lamport)
    }

    fn stamped_message(timestamp: f64, lamport: u64) -> Message {
        let payload = format!("hello at {}", timestamp);
        Message {
            msg_id: MsgId::compute(&"Z".into(), timestamp, payload.as_bytes()),
            topic: "chat".to_string(),
            content: hex::encode(payload),
            sender: "Z".into(),
            timestamp,
            lamport,
        }
    }

    fn subscribed(id: &str) -> Settings {
        let mut s = settings(id, &[]);
        s.initial_topics = vec!["chat".to_string()];
        s
    }

    #[tokio::test]
    async fn test_publish_requires_publisher_role() {
        let mut s = settings("A", &[]);
        s.is_publisher = false;
        let (node, _) = lone_node(s);
        match node.publish("chat", b"hi").await {
            Err(StarlingError::Role(_)) => {}
            other => panic!("expected role error, got {:?}", other.map(|r| r.msg_id)),
        }
        assert_eq!(node.lamport(), 0);
    }

    #[tokio::test]
    async fn test_publish_records_message() {
        let (node, _) = lone_node(settings("A", &[]));
        let receipt = node.publish("chat", b"hi").await.unwrap();
        assert_eq!(receipt.lamport, 1);
        assert!(node.has_seen(&receipt.msg_id));
        let stored = node.stored(&receipt.msg_id).unwrap();
        assert_eq!(stored.content, hex::encode(b"hi"));
    }

    #[tokio::test]
    async fn test_receive_dedups_and_applies_lamport_rule() {
        let mut s = settings("A", &[]);
        s.initial_topics = vec!["chat".to_string()];
        let (node, handler) = lone_node(s);

        node.receive(foreign_message(7)).await.unwrap();
        node.receive(foreign_message(7)).await.unwrap();
        assert_eq!(handler.len(), 1);
        assert_eq!(handler.deliveries()[0].lamport, 8);
        assert_eq!(node.lamport(), 8);
    }

    #[tokio::test]
    async fn test_non_subscriber_ignores_messages() {
        let mut s = settings("A", &[]);
        s.is_subscriber = false;
        let (node, handler) = lone_node(s);
        node.receive(foreign_message(1)).await.unwrap();
        assert_eq!(node.seen_count(), 0);
        assert!(handler.is_empty());

        assert!(matches!(node.subscribe("chat"), Err(StarlingError::Role(_))));
        assert!(node.unsubscribe("chat").is_empty());
    }

    #[tokio::test]
    async fn test_undecryptable_message_is_still_recorded() {
        let mut s = settings("A", &[]);
        s.initial_topics = vec!["chat".to_string()];
        let (node, handler) = lone_node(s);
        let mut message = foreign_message(1);
        message.content = "zz-not-hex".to_string();

        node.receive(message.clone()).await.unwrap();
        assert!(handler.is_empty());
        assert!(node.has_seen(&message.msg_id));
        assert_eq!(node.lamport(), 2);
    }

    #[tokio::test]
    async fn test_subscriptions_and_status() {
        let (node, _) = lone_node(settings("B", &["A", "B", "C=127.0.0.1:5003"]));
        assert_eq!(node.subscribe("sports").unwrap(), vec!["sports"]);
        assert_eq!(node.subscribe("chat").unwrap(), vec!["chat", "sports"]);
        assert_eq!(node.unsubscribe("sports"), vec!["chat"]);

        assert_eq!(node.switch_mode(PubSubMode::Leader), PubSubMode::Gossip);
        let status = node.status();
        assert_eq!(status.node_id, NodeId::from("B"));
        assert_eq!(status.leader_id, NodeId::from("A"));
        assert_eq!(status.mode, PubSubMode::Leader);
        assert_eq!(status.subscriptions, vec!["chat"]);
        assert_eq!(status.peers.len(), 2);
        assert_eq!(status.peers[1].address, "127.0.0.1:5003");
        assert_eq!(status.peers[1].state, PeerState::Unknown);
        assert!(status.peers[1].state_age_secs >= 0.0);
        assert_eq!(status.seen_horizon, None);
        // The in-memory transport keeps no counters
        assert!(status.transport.is_none());
    }

    #[tokio::test]
    async fn test_local_delivery_follows_registry() {
        let (node, handler) = lone_node(subscribed("A"));
        assert!(node.registry.lock().is_subscribed("chat", &"A".into()));

        node.receive(stamped_message(1.0, 1)).await.unwrap();
        assert_eq!(handler.len(), 1);

        node.unsubscribe("chat");
        assert!(node.registry.lock().subscribers("chat").is_empty());
        node.receive(stamped_message(2.0, 1)).await.unwrap();
        assert_eq!(handler.len(), 1);
        assert_eq!(node.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_max_lamport_message_is_dropped() {
        let (node, handler) = lone_node(subscribed("A"));
        let message = foreign_message(u64::MAX);
        node.receive(message.clone()).await.unwrap();
        assert!(!node.has_seen(&message.msg_id));
        assert!(handler.is_empty());
        assert_eq!(node.lamport(), 0);

        // The clock still works for well-formed traffic
        node.receive(foreign_message(u64::MAX - 1)).await.unwrap();
        assert_eq!(node.lamport(), u64::MAX);
        assert_eq!(handler.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_clock_fails_publish_and_skips_delivery() {
        let (node, handler) = lone_node(subscribed("A"));
        assert_eq!(node.clock.observe(u64::MAX - 1), Some(u64::MAX));

        let err = node.publish("chat", b"late").await.unwrap_err();
        assert!(matches!(err, StarlingError::Clock(_)));
        assert_eq!(err.error_type(), "clock_error");
        assert_eq!(node.seen_count(), 0);

        // Recorded so it is not relayed again, but never delivered
        node.receive(foreign_message(3)).await.unwrap();
        assert!(node.has_seen(&foreign_message(3).msg_id));
        assert!(handler.is_empty());
        assert_eq!(node.lamport(), u64::MAX);
    }

    #[tokio::test]
    async fn test_evicted_message_is_not_delivered_again() {
        let mut s = subscribed("A");
        s.seen_capacity = 2;
        let (node, handler) = lone_node(s);
        let msgs: Vec<Message> = (1..=3).map(|n| stamped_message(n as f64, n)).collect();
        for msg in &msgs {
            node.receive(msg.clone()).await.unwrap();
        }
        assert_eq!(handler.len(), 3);
        assert!(!node.has_seen(&msgs[0].msg_id));

        node.receive(msgs[0].clone()).await.unwrap();
        assert_eq!(handler.len(), 3);
        assert_eq!(node.status().seen_horizon, Some(1.0));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings("A", &[]);
        s.data_dir = Some(dir.path().to_path_buf());

        let msg_id = {
            let (node, _) = lone_node(s.clone());
            node.subscribe("chat").unwrap();
            node.publish("chat", b"persist me").await.unwrap().msg_id
        };

        let (node, _) = lone_node(s);
        assert!(node.has_seen(&msg_id));
        assert!(node.stored(&msg_id).is_none());
        assert_eq!(node.subscriptions(), vec!["chat"]);
    }

    #[tokio::test]
    async fn test_seen_log_stays_bounded_and_keeps_horizon() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = subscribed("A");
        s.data_dir = Some(dir.path().to_path_buf());
        s.seen_capacity = 4;
        let log_path = dir.path().join(crate::node::persistence::SEEN_LOG_FILE);

        {
            let (node, handler) = lone_node(s.clone());
            for n in 1..=100u64 {
                node.receive(stamped_message(n as f64, n)).await.unwrap();
                let lines = std::fs::read_to_string(&log_path).unwrap().lines().count();
                assert!(lines <= 9, "{} lines after {} messages", lines, n);
            }
            assert_eq!(handler.len(), 100);
        }

        // An old message stays rejected after a restart
        let (node, handler) = lone_node(s);
        assert_eq!(node.seen_count(), 4);
        assert!(node.has_seen(&stamped_message(100.0, 100).msg_id));
        node.receive(stamped_message(10.0, 10)).await.unwrap();
        assert!(handler.is_empty());
        node.receive(stamped_message(101.0, 101)).await.unwrap();
        assert_eq!(handler.len(), 1);
    }
}
