//! Peer liveness tracking.
//!
//! Every outbound RPC reports its outcome here. A peer moves between
//! `Unknown`, `Alive` and `Unavailable`; observers hear about a peer only
//! when its state actually changes, so a peer that stays down is reported
//! once, not on every failed attempt.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::node::NodeId;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    #[default]
    Unknown,
    Alive,
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerTransition {
    pub peer: NodeId,
    pub from: PeerState,
    pub to: PeerState,
}

pub trait LivenessObserver: Send + Sync {
    fn on_transition(&self, local: &NodeId, transition: &PeerTransition);
}

/// Default observer: one log line per transition
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl LivenessObserver for TracingObserver {
    fn on_transition(&self, local: &NodeId, transition: &PeerTransition) {
        match (transition.from, transition.to) {
            (_, PeerState::Unavailable) => warn!(
                "[{}] Peer {} is unavailable (probably stopped)",
                local, transition.peer
            ),
            (PeerState::Unavailable, PeerState::Alive) => {
                info!("[{}] Peer {} is back online", local, transition.peer)
            }
            (from, to) => debug!(
                "[{}] Peer {} {:?} -> {:?}",
                local, transition.peer, from, to
            ),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PeerEntry {
    state: PeerState,
    since: Instant,
}

pub struct FailureDetector {
    local: NodeId,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn LivenessObserver>,
    states: Mutex<HashMap<NodeId, PeerEntry>>,
}

impl FailureDetector {
    pub fn new(
        local: NodeId,
        peers: &[NodeId],
        transport: Arc<dyn Transport>,
        observer: Arc<dyn LivenessObserver>,
    ) -> Self {
        let now = Instant::now();
        let states = peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    PeerEntry {
                        state: PeerState::Unknown,
                        since: now,
                    },
                )
            })
            .collect();
        Self {
            local,
            transport,
            observer,
            states: Mutex::new(states),
        }
    }

    fn transition(&self, peer: &NodeId, to: PeerState) -> Option<PeerTransition> {
        let transition = {
            let mut states = self.states.lock();
            let entry = states.entry(peer.clone()).or_insert(PeerEntry {
                state: PeerState::Unknown,
                since: Instant::now(),
            });
            if entry.state == to {
                return None;
            }
            let from = entry.state;
            *entry = PeerEntry {
                state: to,
                since: Instant::now(),
            };
            PeerTransition {
                peer: peer.clone(),
                from,
                to,
            }
        };
        self.observer.on_transition(&self.local, &transition);
        Some(transition)
    }

    pub fn record_alive(&self, peer: &NodeId) -> Option<PeerTransition> {
        self.transition(peer, PeerState::Alive)
    }

    pub fn record_unavailable(&self, peer: &NodeId) -> Option<PeerTransition> {
        self.transition(peer, PeerState::Unavailable)
    }

    /// Fold an RPC outcome into the peer's state. Only unavailability
    /// failures count against a peer; other errors leave it untouched.
    pub fn record_result<T>(&self, peer: &NodeId, result: &Result<T>) -> Option<PeerTransition> {
        match result {
            Ok(_) => self.record_alive(peer),
            Err(e) if e.is_unavailable() => self.record_unavailable(peer),
            Err(_) => None,
        }
    }

    pub fn state(&self, peer: &NodeId) -> PeerState {
        self.states
            .lock()
            .get(peer)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    /// Every tracked peer with its state and how long it has held it
    pub fn snapshot(&self) -> HashMap<NodeId, (PeerState, Duration)> {
        self.states
            .lock()
            .iter()
            .map(|(peer, entry)| (peer.clone(), (entry.state, entry.since.elapsed())))
            .collect()
    }

    pub async fn ping(&self, peer: &NodeId) -> Result<()> {
        let result = self.transport.ping(peer).await;
        self.record_result(peer, &result);
        result
    }

    /// The local node is always alive; anyone else must answer a ping
    pub async fn is_peer_alive(&self, peer: &NodeId) -> bool {
        if *peer == self.local {
            return true;
        }
        self.ping(peer).await.is_ok()
    }

    /// Ping all `peers` concurrently and return those that answered, in
    /// the order given.
    pub async fn alive_peers(&self, peers: &[NodeId]) -> Vec<NodeId> {
        let mut pings = JoinSet::new();
        for (idx, peer) in peers.iter().enumerate() {
            if *peer == self.local {
                continue;
            }
            let transport = self.transport.clone();
            let peer = peer.clone();
            pings.spawn(async move {
                let result = transport.ping(&peer).await;
                (idx, peer, result)
            });
        }

        let mut alive = Vec::new();
        while let Some(joined) = pings.join_next().await {
            match joined {
                Ok((idx, peer, result)) => {
                    self.record_result(&peer, &result);
                    if result.is_ok() {
                        alive.push((idx, peer));
                    }
                }
                Err(e) => warn!("[{}] Liveness ping task failed: {}", self.local, e),
            }
        }
        alive.sort_by_key(|(idx, _)| *idx);
        alive.into_iter().map(|(_, peer)| peer).collect()
    }
}

/// Observer that keeps every transition, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingObserver {
    transitions: Mutex<Vec<PeerTransition>>,
}

impl RecordingObserver {
    pub fn transitions(&self) -> Vec<PeerTransition> {
        self.transitions.lock().clone()
    }

    /// Transitions into `to` for `peer`
    pub fn count(&self, peer: &NodeId, to: PeerState) -> usize {
        self.transitions
            .lock()
            .iter()
            .filter(|t| t.peer == *peer && t.to == to)
            .count()
    }
}

impl LivenessObserver for RecordingObserver {
    fn on_transition(&self, _local: &NodeId, transition: &PeerTransition) {
        self.transitions.lock().push(transition.clone());
    }
}
