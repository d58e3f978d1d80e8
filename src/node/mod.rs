//! A bus node: the delivery coordinator plus the loop that feeds it inbound
//! peer requests and drives the periodic anti-entropy and leader checks.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub mod clock;
pub mod coordinator;
pub mod gossip;
pub mod leader;
pub mod liveness;
pub mod messages;
pub mod node_id;
pub mod peers;
pub mod persistence;
pub mod topics;

use crate::settings::Settings;
use crate::transport::{self, PeerRequest};
pub use coordinator::DeliveryCoordinator;
pub use node_id::NodeId;

pub struct Node {
    coordinator: Arc<DeliveryCoordinator>,
    sync_interval: Duration,
    leader_check_interval: Duration,
}

impl Node {
    pub fn new(coordinator: Arc<DeliveryCoordinator>, settings: &Settings) -> Self {
        Self {
            coordinator,
            sync_interval: settings.sync_interval(),
            leader_check_interval: settings.leader_check_interval(),
        }
    }

    pub fn coordinator(&self) -> Arc<DeliveryCoordinator> {
        self.coordinator.clone()
    }

    /// Run until the inbound channel closes. Each request and each timer
    /// tick is handled on its own task; a periodic job is skipped while its
    /// previous run is still going.
    pub async fn run(self, mut inbound_rx: mpsc::Receiver<PeerRequest>) {
        let node_id = self.coordinator.node_id().clone();
        info!(
            "[{}] Node running (anti-entropy every {:?}, leader check every {:?})",
            node_id, self.sync_interval, self.leader_check_interval
        );

        let mut sync_timer = interval_at(Instant::now() + self.sync_interval, self.sync_interval);
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut leader_timer = interval_at(
            Instant::now() + self.leader_check_interval,
            self.leader_check_interval,
        );
        leader_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut sync_task: Option<JoinHandle<()>> = None;
        let mut leader_task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                request = inbound_rx.recv() => {
                    let Some(request) = request else {
                        info!("[{}] Inbound channel closed, stopping", node_id);
                        break;
                    };
                    let coordinator = self.coordinator.clone();
                    tokio::spawn(async move {
                        transport::dispatch(coordinator.as_ref(), request).await;
                    });
                }
                _ = sync_timer.tick() => {
                    if is_running(&sync_task) {
                        debug!("[{}] Previous anti-entropy round still running", node_id);
                        continue;
                    }
                    let coordinator = self.coordinator.clone();
                    sync_task = Some(tokio::spawn(async move {
                        if let Err(e) = coordinator.push_seen_msgs().await {
                            warn!("[{}] Anti-entropy round failed: {}", coordinator.node_id(), e);
                        }
                    }));
                }
                _ = leader_timer.tick() => {
                    if is_running(&leader_task) {
                        continue;
                    }
                    let coordinator = self.coordinator.clone();
                    leader_task = Some(tokio::spawn(async move {
                        coordinator.check_leader().await;
                    }));
                }
            }
        }

        for task in [sync_task, leader_task].into_iter().flatten() {
            task.abort();
        }
    }
}

fn is_running(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().map_or(false, |t| !t.is_finished())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::gossip::FixedSelector;
    use crate::node::messages::{Message, MsgId};
    use crate::transport::MemoryNetwork;

    #[tokio::test]
    async fn test_run_loop_dispatches_and_stops() {
        let network = MemoryNetwork::new();
        let mut settings = Settings::new("A");
        settings.sync_interval_ms = 10;
        settings.leader_check_interval_ms = 10;
        let coordinator = Arc::new(
            DeliveryCoordinator::builder(settings.clone(), Arc::new(network.transport("A")))
                .selector(FixedSelector)
                .build()
                .unwrap(),
        );

        let (tx, rx) = mpsc::channel(8);
        let node = Node::new(coordinator.clone(), &settings);
        let handle = tokio::spawn(node.run(rx));

        let message = Message {
            msg_id: MsgId::compute(&"B".into(), 1.0, b"hi"),
            topic: "chat".to_string(),
            content: hex::encode(b"hi"),
            sender: "B".into(),
            timestamp: 1.0,
            lamport: 4,
        };
        tx.send(PeerRequest::SendMessage(message.clone())).await.unwrap();
        tx.send(PeerRequest::Ping).await.unwrap();

        for _ in 0..50 {
            if coordinator.has_seen(&message.msg_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(coordinator.has_seen(&message.msg_id));
        assert_eq!(coordinator.lamport(), 5);

        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
