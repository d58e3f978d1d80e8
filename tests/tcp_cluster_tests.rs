use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use starling::node::gossip::FixedSelector;
use starling::node::liveness::PeerState;
use starling::node::messages::MsgId;
use starling::node::topics::CollectingHandler;
use starling::node::{DeliveryCoordinator, Node};
use starling::settings::{PeerSpec, PubSubMode, Settings};
use starling::transport::{PeerRequest, TcpReceiver, TcpTransport};

struct TcpNode {
    coordinator: Arc<DeliveryCoordinator>,
    deliveries: Arc<CollectingHandler>,
}

/// Bind every receiver first so each node's peer list carries real ports
async fn start_cluster(ids: &[&str], mode: PubSubMode) -> Vec<TcpNode> {
    let mut bound: Vec<(TcpReceiver, mpsc::Receiver<PeerRequest>)> = Vec::new();
    for _ in ids {
        let (tx, rx) = mpsc::channel(64);
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        bound.push((TcpReceiver::new(addr, tx).await.unwrap(), rx));
    }
    let peers: Vec<PeerSpec> = ids
        .iter()
        .zip(&bound)
        .map(|(id, (receiver, _))| format!("{}={}", id, receiver.local_addr).parse().unwrap())
        .collect();

    let mut nodes = Vec::new();
    for (id, (receiver, inbound_rx)) in ids.iter().zip(bound) {
        let mut settings = Settings::new(*id);
        settings.peers = peers.clone();
        settings.mode = mode;
        settings.gossip_fanout = 2;
        settings.rpc_timeout_ms = 500;
        settings.initial_topics = vec!["chat".to_string()];

        let transport = Arc::new(TcpTransport::new(
            settings.peer_directory(),
            settings.rpc_timeout(),
        ));
        let deliveries = Arc::new(CollectingHandler::default());
        let coordinator = Arc::new(
            DeliveryCoordinator::builder(settings.clone(), transport)
                .selector(FixedSelector)
                .handler(deliveries.clone())
                .build()
                .unwrap(),
        );
        receiver.start();
        tokio::spawn(Node::new(coordinator.clone(), &settings).run(inbound_rx));
        nodes.push(TcpNode {
            coordinator,
            deliveries,
        });
    }
    nodes
}

async fn wait_for_seen(node: &TcpNode, msg_id: &MsgId) {
    timeout(Duration::from_secs(5), async {
        while !node.coordinator.has_seen(msg_id) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} never saw {:?}", node.coordinator.node_id(), msg_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gossip_over_tcp() {
    let nodes = start_cluster(&["A", "B", "C"], PubSubMode::Gossip).await;
    let receipt = nodes[0]
        .coordinator
        .publish("chat", b"over the wire")
        .await
        .unwrap();

    for node in &nodes[1..] {
        wait_for_seen(node, &receipt.msg_id).await;
    }
    // Let any trailing duplicate relays land before counting
    sleep(Duration::from_millis(100)).await;
    for node in &nodes[1..] {
        let deliveries = node.deliveries.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message, "over the wire");
        assert_eq!(deliveries[0].sender.as_str(), "A");
    }

    // A flooded to both peers over real connections
    let status = nodes[0].coordinator.status();
    let stats = status.transport.expect("tcp transport keeps counters");
    assert!(stats.requests_sent >= 2);
    assert!(stats.acks_received >= 2);
    assert!(stats.connections_opened >= 2);
    assert!(status
        .peers
        .iter()
        .any(|peer| peer.state == PeerState::Alive));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_relay_over_tcp() {
    let nodes = start_cluster(&["A", "B", "C"], PubSubMode::Leader).await;
    let receipt = nodes[2]
        .coordinator
        .publish("chat", b"via leader")
        .await
        .unwrap();

    wait_for_seen(&nodes[0], &receipt.msg_id).await;
    wait_for_seen(&nodes[1], &receipt.msg_id).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(nodes[0].deliveries.len(), 1);
    assert_eq!(nodes[1].deliveries.len(), 1);
    assert!(nodes[2].deliveries.is_empty());
}
