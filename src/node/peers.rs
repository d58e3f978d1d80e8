//! Static peer directory: node id to transport address.
use indexmap::IndexMap;

use crate::config_error;
use crate::error::Result;
use crate::node::NodeId;

#[derive(Clone, Debug, Default)]
pub struct PeerDirectory {
    // IndexMap keeps the configured order for deterministic selection
    peers: IndexMap<NodeId, String>,
}

impl PeerDirectory {
    /// Build a directory for `local`, dropping any entry for the local node
    pub fn new(local: &NodeId, entries: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        let peers = entries
            .into_iter()
            .filter(|(id, _)| id != local)
            .collect();
        Self { peers }
    }

    pub fn address(&self, peer: &NodeId) -> Result<&str> {
        self.peers
            .get(peer)
            .map(String::as_str)
            .ok_or_else(|| config_error!("No known address for peer {}", peer))
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.peers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &str)> {
        self.peers.iter().map(|(id, addr)| (id, addr.as_str()))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
