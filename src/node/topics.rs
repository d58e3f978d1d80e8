//! Topic subscriptions and local delivery.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, trace};

use crate::node::messages::Delivery;
use crate::node::NodeId;

/// Which nodes are subscribed to which topics
#[derive(Debug, Default)]
pub struct TopicRegistry {
    subscriptions: HashMap<String, HashSet<NodeId>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: &str, node_id: &NodeId) -> bool {
        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(node_id.clone())
    }

    pub fn unsubscribe(&mut self, topic: &str, node_id: &NodeId) -> bool {
        let Some(subscribers) = self.subscriptions.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(node_id);
        if subscribers.is_empty() {
            self.subscriptions.remove(topic);
        }
        removed
    }

    /// Empty for unknown topics
    pub fn subscribers(&self, topic: &str) -> HashSet<NodeId> {
        self.subscriptions.get(topic).cloned().unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &str, node_id: &NodeId) -> bool {
        self.subscriptions
            .get(topic)
            .map_or(false, |subscribers| subscribers.contains(node_id))
    }

    pub fn topics_for(&self, node_id: &NodeId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, subscribers)| subscribers.contains(node_id))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }
}

/// Where deliveries end up
pub trait DeliveryHandler: Send + Sync {
    fn deliver(&self, local: &NodeId, delivery: &Delivery);
}

/// Logs each delivery
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDeliveryHandler;

impl DeliveryHandler for LogDeliveryHandler {
    fn deliver(&self, local: &NodeId, delivery: &Delivery) {
        let latency = delivery
            .latency_secs
            .map(|l| format!("{:.4}s", l))
            .unwrap_or_else(|| "n/a".to_string());
        info!(
            "[{}] Received | Sender: [{}] | Topic: {} | Message: {} | Latency: {} | Lamport: {}",
            local, delivery.sender, delivery.topic, delivery.message, latency, delivery.lamport
        );
    }
}

/// Keeps every delivery in memory
#[derive(Debug, Default)]
pub struct CollectingHandler {
    deliveries: RwLock<Vec<Delivery>>,
}

impl CollectingHandler {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.deliveries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.read().is_empty()
    }
}

impl DeliveryHandler for CollectingHandler {
    fn deliver(&self, _local: &NodeId, delivery: &Delivery) {
        self.deliveries.write().push(delivery.clone());
    }
}

/// The local node's subscriber: what to do on delivery. Which topics it
/// takes is decided by the registry.
pub struct LocalSubscriber {
    node_id: NodeId,
    handler: Arc<dyn DeliveryHandler>,
    delivered: AtomicU64,
}

impl LocalSubscriber {
    pub fn new(node_id: NodeId, handler: Arc<dyn DeliveryHandler>) -> Self {
        Self {
            node_id,
            handler,
            delivered: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Deliver if the registry has this node on the topic; otherwise absorb
    /// silently. Returns whether the handler was invoked.
    pub fn receive(&self, registry: &TopicRegistry, delivery: &Delivery) -> bool {
        if !registry.is_subscribed(&delivery.topic, &self.node_id) {
            trace!(
                "[{}] Not subscribed to '{}', absorbing {:?}",
                self.node_id,
                delivery.topic,
                delivery.msg_id
            );
            return false;
        }
        self.handler.deliver(&self.node_id, delivery);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        true
    }
}
