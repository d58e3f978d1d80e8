//! Leader election and propagation mode.
//!
//! The leader is the lexicographically smallest node id among those known
//! to be alive. Election is re-run only when a follower finds the current
//! leader unreachable; there is no term or quorum, so two partitions may
//! briefly disagree about who leads.
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::node::liveness::FailureDetector;
use crate::node::NodeId;
use crate::settings::PubSubMode;

/// Smallest id among `local` and `alive`
pub fn calc_leader(local: &NodeId, alive: &[NodeId]) -> NodeId {
    alive
        .iter()
        .chain(std::iter::once(local))
        .min()
        .cloned()
        .unwrap_or_else(|| local.clone())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderState {
    pub leader_id: NodeId,
    pub mode: PubSubMode,
}

pub struct LeaderElector {
    local: NodeId,
    peers: Vec<NodeId>,
    detector: Arc<FailureDetector>,
    state: RwLock<LeaderState>,
}

impl LeaderElector {
    /// Initial leader is chosen over every configured node, alive or not
    pub fn new(
        local: NodeId,
        peers: Vec<NodeId>,
        detector: Arc<FailureDetector>,
        mode: PubSubMode,
    ) -> Self {
        let leader_id = calc_leader(&local, &peers);
        info!("[{}] Initial leader: {} (mode {})", local, leader_id, mode);
        Self {
            local,
            peers,
            detector,
            state: RwLock::new(LeaderState { leader_id, mode }),
        }
    }

    pub fn state(&self) -> LeaderState {
        self.state.read().clone()
    }

    pub fn leader_id(&self) -> NodeId {
        self.state.read().leader_id.clone()
    }

    pub fn mode(&self) -> PubSubMode {
        self.state.read().mode
    }

    pub fn is_leader(&self) -> bool {
        self.state.read().leader_id == self.local
    }

    /// Switch propagation mode, returning the previous one
    pub fn set_mode(&self, mode: PubSubMode) -> PubSubMode {
        let previous = std::mem::replace(&mut self.state.write().mode, mode);
        if previous != mode {
            info!("[{}] Mode switched: {} -> {}", self.local, previous, mode);
        }
        previous
    }

    pub async fn is_leader_alive(&self) -> bool {
        let leader = self.leader_id();
        self.detector.is_peer_alive(&leader).await
    }

    /// Periodic check run by followers. When the leader does not answer,
    /// ping every peer and elect again among those alive. Returns the new
    /// leader if it changed.
    pub async fn check_leader(&self) -> Option<NodeId> {
        let current = self.leader_id();
        if current == self.local || self.is_leader_alive().await {
            return None;
        }
        warn!(
            "[{}] Leader {} is not responding, electing a new one",
            self.local, current
        );

        let alive = self.detector.alive_peers(&self.peers).await;
        let next = calc_leader(&self.local, &alive);

        let mut state = self.state.write();
        // Another check may have already moved on
        if state.leader_id != current || next == current {
            return None;
        }
        state.leader_id = next.clone();
        info!("[{}] New leader: {}", self.local, next);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::node::liveness::TracingObserver;
    use crate::node::messages::{Message, SeenDigest};
    use crate::transport::{MemoryNetwork, PeerService};

    struct Idle;

    #[async_trait]
    impl PeerService for Idle {
        async fn on_message(&self, _message: Message) {}
        async fn on_seen_msgs(&self, _sender: NodeId, _digest: SeenDigest) {}
    }

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn elector(network: &Arc<MemoryNetwork>, local: &str, peers: &[&str]) -> LeaderElector {
        let transport = Arc::new(network.transport(local));
        let detector = Arc::new(FailureDetector::new(
            local.into(),
            &ids(peers),
            transport,
            Arc::new(TracingObserver),
        ));
        LeaderElector::new(local.into(), ids(peers), detector, PubSubMode::Leader)
    }

    #[test]
    fn test_calc_leader() {
        assert_eq!(calc_leader(&"B".into(), &ids(&["C", "A"])), NodeId::from("A"));
        assert_eq!(calc_leader(&"B".into(), &ids(&["C", "D"])), NodeId::from("B"));
        assert_eq!(calc_leader(&"B".into(), &[]), NodeId::from("B"));
    }

    #[test]
    fn test_initial_leader_ignores_liveness() {
        let network = MemoryNetwork::new();
        let elector = elector(&network, "B", &["A", "C"]);
        assert_eq!(elector.leader_id(), NodeId::from("A"));
        assert!(!elector.is_leader());
    }

    #[test]
    fn test_set_mode_returns_previous() {
        let network = MemoryNetwork::new();
        let elector = elector(&network, "A", &["B"]);
        assert_eq!(elector.set_mode(PubSubMode::Gossip), PubSubMode::Leader);
        assert_eq!(elector.set_mode(PubSubMode::Gossip), PubSubMode::Gossip);
        assert_eq!(elector.mode(), PubSubMode::Gossip);
        // Mode changes leave the leader alone
        assert_eq!(elector.leader_id(), NodeId::from("A"));
    }

    #[tokio::test]
    async fn test_failover_to_next_smallest_alive() {
        let network = MemoryNetwork::new();
        let idle: Arc<dyn PeerService> = Arc::new(Idle);
        for name in ["A", "B", "C"] {
            network.register(name, idle.clone());
        }
        let elector = elector(&network, "C", &["A", "B"]);
        assert_eq!(elector.check_leader().await, None);

        network.set_down("A", true);
        assert_eq!(elector.check_leader().await, Some(NodeId::from("B")));
        assert_eq!(elector.leader_id(), NodeId::from("B"));

        // A returning does not trigger re-election while B answers
        network.set_down("A", false);
        assert_eq!(elector.check_leader().await, None);
        assert_eq!(elector.leader_id(), NodeId::from("B"));
    }

    #[tokio::test]
    async fn test_leader_never_checks_itself() {
        let network = MemoryNetwork::new();
        let elector = elector(&network, "A", &["B", "C"]);
        // No peers registered at all, yet the leader stays put
        assert!(elector.is_leader());
        assert_eq!(elector.check_leader().await, None);
    }
}
