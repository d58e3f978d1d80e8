//! CLI for this application
//!
use std::path::PathBuf;

use crate::error::Result;
use crate::node::NodeId;
use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[command(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Identity of this node on the bus
    #[clap(long, env("STARLING_NODE_ID"), help = "Unique id of this node (e.g. A)")]
    pub node_id: String,

    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("STARLING_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("STARLING_HTTP_LISTEN_PORT"),
        help = "Port to bind the Starling HTTP API server to"
    )]
    pub listen_port: u16,

    // TCP listen port for peer traffic
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_PEER,
        env("STARLING_PEER_LISTEN_PORT"),
        help = "Port to bind the peer TCP server to"
    )]
    pub listen_port_peer: u16,

    // Cluster membership
    #[clap(
        long,
        env("STARLING_PEERS"),
        value_delimiter = ',',
        help = "Cluster members as ID or ID=host:port (e.g. A,B,C=10.0.0.3:5000). Bare ids resolve to node_<id>:<peer port>"
    )]
    pub peers: Vec<settings::PeerSpec>,

    #[clap(
        long,
        default_value = "gossip",
        env("STARLING_MODE"),
        help = "Propagation mode: 'gossip' or 'leader'"
    )]
    pub mode: settings::PubSubMode,

    #[clap(
        long,
        default_value = settings::DEFAULT_GOSSIP_FANOUT,
        env("STARLING_GOSSIP_FANOUT"),
        help = "Peers contacted per gossip round"
    )]
    pub gossip_fanout: usize,

    #[clap(
        long,
        default_value = settings::DEFAULT_SYNC_INTERVAL_MS,
        env("STARLING_SYNC_INTERVAL_MS"),
        help = "Anti-entropy interval in milliseconds"
    )]
    pub sync_interval_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_LEADER_CHECK_INTERVAL_MS,
        env("STARLING_LEADER_CHECK_INTERVAL_MS"),
        help = "Leader liveness check interval in milliseconds"
    )]
    pub leader_check_interval_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_RPC_TIMEOUT_MS,
        env("STARLING_RPC_TIMEOUT_MS"),
        help = "Peer request timeout in milliseconds"
    )]
    pub rpc_timeout_ms: u64,

    #[clap(
        long,
        default_value = settings::DEFAULT_SEEN_CAPACITY,
        env("STARLING_SEEN_CAPACITY"),
        help = "Maximum number of message ids remembered for dedup"
    )]
    pub seen_capacity: usize,

    #[clap(
        long,
        default_value = "true",
        env("STARLING_PUBLISHER"),
        action = clap::ArgAction::Set,
        help = "Whether this node may publish"
    )]
    pub publisher: bool,

    #[clap(
        long,
        default_value = "true",
        env("STARLING_SUBSCRIBER"),
        action = clap::ArgAction::Set,
        help = "Whether this node subscribes and relays"
    )]
    pub subscriber: bool,

    #[clap(
        long,
        env("STARLING_TOPICS"),
        value_delimiter = ',',
        help = "Topics to subscribe to at startup (e.g. chat,alerts)"
    )]
    pub topics: Vec<String>,

    #[clap(
        long,
        env("STARLING_DATA_DIR"),
        help = "Directory for the seen-message log and subscriptions. Nothing is persisted if unset"
    )]
    pub data_dir: Option<PathBuf>,

    #[clap(
        long,
        env("STARLING_CLUSTER_KEY"),
        help = "Hex encoded 32-byte payload key shared by all nodes"
    )]
    pub cluster_key: Option<String>,
}

impl Cli {
    pub fn into_settings(self) -> Result<settings::Settings> {
        let settings = settings::Settings {
            node_id: NodeId::new(self.node_id.trim()),
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            listen_port_peer: self.listen_port_peer,
            peers: self.peers,
            mode: self.mode,
            gossip_fanout: self.gossip_fanout,
            sync_interval_ms: self.sync_interval_ms,
            leader_check_interval_ms: self.leader_check_interval_ms,
            rpc_timeout_ms: self.rpc_timeout_ms,
            seen_capacity: self.seen_capacity,
            is_publisher: self.publisher,
            is_subscriber: self.subscriber,
            initial_topics: self
                .topics
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            data_dir: self.data_dir,
            cluster_key: self.cluster_key,
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["starling", "--node-id", "A"]).unwrap();
        let settings = cli.into_settings().unwrap();
        assert_eq!(settings.node_id, NodeId::from("A"));
        assert_eq!(settings.listen_port, settings::STANDARD_PORT_HTTP);
        assert_eq!(settings.listen_port_peer, settings::STANDARD_PORT_PEER);
        assert_eq!(settings.mode, settings::PubSubMode::Gossip);
        assert_eq!(settings.gossip_fanout, 3);
        assert!(settings.is_publisher && settings.is_subscriber);
        assert!(settings.peers.is_empty());
    }

    #[test]
    fn test_peers_and_roles() {
        let cli = Cli::try_parse_from([
            "starling",
            "--node-id",
            "B",
            "--peers",
            "A,B,C=127.0.0.1:5003",
            "--mode",
            "leader",
            "--publisher",
            "false",
            "--topics",
            "chat, alerts",
        ])
        .unwrap();
        let settings = cli.into_settings().unwrap();
        assert_eq!(settings.peers.len(), 3);
        assert_eq!(settings.mode, settings::PubSubMode::Leader);
        assert!(!settings.is_publisher);
        assert_eq!(settings.initial_topics, vec!["chat", "alerts"]);

        let directory = settings.peer_directory();
        assert_eq!(directory.ids(), vec![NodeId::from("A"), NodeId::from("C")]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Cli::try_parse_from(["starling", "--node-id", "A", "--mode", "raft"]).is_err());
        let cli =
            Cli::try_parse_from(["starling", "--node-id", "A", "--gossip-fanout", "0"]).unwrap();
        assert!(cli.into_settings().is_err());
    }
}
