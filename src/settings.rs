//! Starling application settings
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::crypto::{ChaChaCipher, Cipher, PlainCodec};
use crate::error::Result;
use crate::node::peers::PeerDirectory;
use crate::node::NodeId;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_HTTP: u16 = 8000;
pub const DEFAULT_PORT_HTTP: &str = "8000";
pub const STANDARD_PORT_PEER: u16 = 5000;
pub const DEFAULT_PORT_PEER: &str = "5000";

pub const DEFAULT_GOSSIP_FANOUT: &str = "3";
pub const DEFAULT_SYNC_INTERVAL_MS: &str = "5000";
pub const DEFAULT_LEADER_CHECK_INTERVAL_MS: &str = "5000";
pub const DEFAULT_RPC_TIMEOUT_MS: &str = "2000";
pub const DEFAULT_SEEN_CAPACITY: &str = "100000";

/// How published messages travel through the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubMode {
    #[default]
    Gossip,
    Leader,
}

impl std::fmt::Display for PubSubMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubMode::Gossip => write!(f, "gossip"),
            PubSubMode::Leader => write!(f, "leader"),
        }
    }
}

impl std::str::FromStr for PubSubMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gossip" => Ok(PubSubMode::Gossip),
            "leader" => Ok(PubSubMode::Leader),
            _ => Err(format!("Invalid pub/sub mode: {}", s)),
        }
    }
}

/// A cluster member as given on the command line: `A` or `A=host:port`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSpec {
    pub node_id: NodeId,
    pub address: Option<String>,
}

impl std::str::FromStr for PeerSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (id, address) = match s.split_once('=') {
            Some((id, address)) => (id.trim(), Some(address.trim())),
            None => (s, None),
        };
        if id.is_empty() {
            return Err(format!("Invalid peer '{}': empty node id", s));
        }
        if let Some(address) = address {
            if address.rsplit_once(':').is_none() {
                return Err(format!("Invalid peer '{}': address needs host:port", s));
            }
        }
        Ok(PeerSpec {
            node_id: id.into(),
            address: address.map(str::to_string),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub node_id: NodeId,

    // Server listen address
    pub listen_address: String,

    // HTTP API listen port
    pub listen_port: u16,

    // TCP listen port for peer traffic
    pub listen_port_peer: u16,

    // All cluster members; the local node is filtered out
    pub peers: Vec<PeerSpec>,

    pub mode: PubSubMode,

    // Gossip configuration
    pub gossip_fanout: usize,
    pub sync_interval_ms: u64,

    pub leader_check_interval_ms: u64,
    pub rpc_timeout_ms: u64,

    // Upper bound on remembered message ids and bodies
    pub seen_capacity: usize,

    pub is_publisher: bool,
    pub is_subscriber: bool,
    pub initial_topics: Vec<String>,

    pub data_dir: Option<PathBuf>,
    // Hex encoded 32-byte key shared by the cluster
    pub cluster_key: Option<String>,
}

impl Settings {
    /// Settings with defaults for everything but the node id
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            listen_address: "0.0.0.0".to_string(),
            listen_port: STANDARD_PORT_HTTP,
            listen_port_peer: STANDARD_PORT_PEER,
            peers: Vec::new(),
            mode: PubSubMode::Gossip,
            gossip_fanout: 3,
            sync_interval_ms: 5000,
            leader_check_interval_ms: 5000,
            rpc_timeout_ms: 2000,
            seen_capacity: 100_000,
            is_publisher: true,
            is_subscriber: true,
            initial_topics: Vec::new(),
            data_dir: None,
            cluster_key: None,
        }
    }

    pub fn peer_directory(&self) -> PeerDirectory {
        let entries = self.peers.iter().map(|peer| {
            let address = peer.address.clone().unwrap_or_else(|| {
                format!("{}:{}", peer.node_id.default_host(), self.listen_port_peer)
            });
            (peer.node_id.clone(), address)
        });
        PeerDirectory::new(&self.node_id, entries)
    }

    fn listen_ip(&self) -> Result<IpAddr> {
        self.listen_address
            .parse::<IpAddr>()
            .map_err(|e| config_error!("Invalid listen address '{}': {}", self.listen_address, e))
    }

    pub fn http_listen_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from((self.listen_ip()?, self.listen_port)))
    }

    pub fn peer_listen_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::from((self.listen_ip()?, self.listen_port_peer)))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn leader_check_interval(&self) -> Duration {
        Duration::from_millis(self.leader_check_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Payload cipher: ChaCha20-Poly1305 with the cluster key, or hex-only
    /// encoding when no key is configured.
    pub fn cipher(&self) -> Result<Arc<dyn Cipher>> {
        match &self.cluster_key {
            Some(key) => Ok(Arc::new(ChaChaCipher::from_hex(key)?)),
            None => Ok(Arc::new(PlainCodec)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.as_str().is_empty() {
            return Err(config_error!("Node id must not be empty"));
        }
        if self.gossip_fanout == 0 {
            return Err(config_error!("Gossip fanout must be at least 1"));
        }
        if self.sync_interval_ms == 0 || self.leader_check_interval_ms == 0 {
            return Err(config_error!("Timer intervals must be positive"));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(config_error!("RPC timeout must be positive"));
        }
        if self.seen_capacity == 0 {
            return Err(config_error!("Seen capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("gossip".parse::<PubSubMode>().unwrap(), PubSubMode::Gossip);
        assert_eq!("LEADER".parse::<PubSubMode>().unwrap(), PubSubMode::Leader);
        assert!("raft".parse::<PubSubMode>().is_err());
        assert_eq!(PubSubMode::Leader.to_string(), "leader");
        assert_eq!(
            serde_json::to_string(&PubSubMode::Gossip).unwrap(),
            "\"gossip\""
        );
    }

    #[test]
    fn test_peer_spec_parse() {
        let bare: PeerSpec = "B".parse().unwrap();
        assert_eq!(bare.node_id, NodeId::from("B"));
        assert_eq!(bare.address, None);

        let full: PeerSpec = " C=127.0.0.1:5002 ".parse().unwrap();
        assert_eq!(full.node_id, NodeId::from("C"));
        assert_eq!(full.address.as_deref(), Some("127.0.0.1:5002"));

        assert!("=127.0.0.1:5000".parse::<PeerSpec>().is_err());
        assert!("D=localhost".parse::<PeerSpec>().is_err());
    }

    #[test]
    fn test_peer_directory_defaults_addresses() {
        let mut settings = Settings::new("A");
        settings.peers = vec![
            "A".parse().unwrap(),
            "B".parse().unwrap(),
            "C=10.0.0.3:7000".parse().unwrap(),
        ];
        let directory = settings.peer_directory();
        assert_eq!(directory.len(), 2);
        assert_eq!(directory.address(&"B".into()).unwrap(), "node_b:5000");
        assert_eq!(directory.address(&"C".into()).unwrap(), "10.0.0.3:7000");
    }

    #[test]
    fn test_listen_addresses() {
        let mut settings = Settings::new("A");
        settings.listen_address = "127.0.0.1".to_string();
        settings.listen_port = 8001;
        settings.listen_port_peer = 5001;
        assert_eq!(
            settings.http_listen_addr().unwrap(),
            "127.0.0.1:8001".parse().unwrap()
        );
        assert_eq!(
            settings.peer_listen_addr().unwrap(),
            "127.0.0.1:5001".parse().unwrap()
        );

        settings.listen_address = "not-an-ip".to_string();
        assert!(settings.http_listen_addr().is_err());
    }

    #[test]
    fn test_validate() {
        let mut settings = Settings::new("A");
        assert!(settings.validate().is_ok());
        settings.gossip_fanout = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_cipher_selection() {
        let mut settings = Settings::new("A");
        let plain = settings.cipher().unwrap();
        assert_eq!(plain.decrypt(&plain.encrypt(b"hi").unwrap()).unwrap(), b"hi");

        settings.cluster_key = Some("zz".to_string());
        assert!(settings.cipher().is_err());

        settings.cluster_key = Some("11".repeat(32));
        let sealed = settings.cipher().unwrap();
        let content = sealed.encrypt(b"hi").unwrap();
        assert!(plain.decrypt(&content).unwrap() != b"hi");
        assert_eq!(sealed.decrypt(&content).unwrap(), b"hi");
    }
}
