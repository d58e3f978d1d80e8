use crate::node::NodeId;

/// Chooses which peers receive a gossip round
pub trait PeerSelector: Send + Sync {
    fn select(&self, peers: &[NodeId], fanout: usize) -> Vec<NodeId>;
}

/// Uniformly random subset of `min(fanout, peers)` peers
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSelector;

impl PeerSelector for RandomSelector {
    fn select(&self, peers: &[NodeId], fanout: usize) -> Vec<NodeId> {
        let amount = fanout.min(peers.len());
        rand::seq::index::sample(&mut rand::rng(), peers.len(), amount)
            .into_iter()
            .map(|idx| peers[idx].clone())
            .collect()
    }
}

/// First `fanout` peers in directory order. Deterministic, for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedSelector;

impl PeerSelector for FixedSelector {
    fn select(&self, peers: &[NodeId], fanout: usize) -> Vec<NodeId> {
        peers.iter().take(fanout).cloned().collect()
    }
}
