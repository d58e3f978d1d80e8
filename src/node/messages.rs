//! Messages carried on the bus and the views of node state handed to the
//! HTTP control plane.
use std::fmt;
use std::str::FromStr;

use bincode::{Decode, Encode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::node::liveness::PeerState;
use crate::node::NodeId;
use crate::settings::PubSubMode;
use crate::transport::TransportStats;

pub const MSG_ID_LEN: usize = 32;

/// Content-addressed message identifier: SHA-256 over
/// (origin id, origin timestamp, plaintext payload).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct MsgId([u8; MSG_ID_LEN]);

impl MsgId {
    pub fn compute(origin: &NodeId, timestamp: f64, payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(origin.as_str().as_bytes());
        hasher.update(b"-");
        hasher.update(timestamp.to_string().as_bytes());
        hasher.update(b"-");
        hasher.update(payload);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; MSG_ID_LEN] {
        &self.0
    }
}

impl From<[u8; MSG_ID_LEN]> for MsgId {
    fn from(bytes: [u8; MSG_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId({})", &hex::encode(self.0)[..12])
    }
}

impl FromStr for MsgId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; MSG_ID_LEN];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| format!("Invalid message id '{}': {}", s, e))?;
        Ok(Self(bytes))
    }
}

impl Serialize for MsgId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MsgId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A published message as it travels between peers. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Message {
    pub msg_id: MsgId,
    pub topic: String,
    /// Encrypted payload, opaque to everything but the cipher
    pub content: String,
    pub sender: NodeId,
    /// Origin wall-clock time, seconds since the epoch
    pub timestamp: f64,
    pub lamport: u64,
}

/// Anti-entropy push: the ids a node holds and its retention horizon.
/// Messages whose origin timestamp is at or below `horizon` have been
/// forgotten by the sender and must not be resent to it.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct SeenDigest {
    pub horizon: f64,
    pub msg_ids: Vec<MsgId>,
}

impl SeenDigest {
    pub fn new(horizon: f64, msg_ids: Vec<MsgId>) -> Self {
        Self { horizon, msg_ids }
    }

    /// Whether `message` is still inside the sender's retention window
    pub fn retains(&self, message: &Message) -> bool {
        message.timestamp > self.horizon
    }
}

/// What a local subscriber receives for a message on one of its topics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub msg_id: MsgId,
    pub topic: String,
    pub sender: NodeId,
    pub message: String,
    pub timestamp: f64,
    pub lamport: u64,
    pub latency_secs: Option<f64>,
}

impl Delivery {
    pub fn new(msg: &Message, plaintext: &[u8], lamport: u64, now: f64) -> Self {
        let latency = now - msg.timestamp;
        Self {
            msg_id: msg.msg_id,
            topic: msg.topic.clone(),
            sender: msg.sender.clone(),
            message: String::from_utf8_lossy(plaintext).into_owned(),
            timestamp: msg.timestamp,
            lamport,
            latency_secs: (latency >= 0.0).then_some(latency),
        }
    }
}

/// Returned to the caller of publish
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub msg_id: MsgId,
    pub lamport: u64,
    pub mode: PubSubMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerStatus {
    pub node_id: NodeId,
    pub address: String,
    pub state: PeerState,
    /// Seconds since the peer entered `state`
    pub state_age_secs: f64,
}

/// Node status exposed on `GET /status`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: NodeId,
    pub subscriptions: Vec<String>,
    pub leader_id: NodeId,
    pub mode: PubSubMode,
    pub lamport: u64,
    pub seen_count: usize,
    pub seen_horizon: Option<f64>,
    pub peers: Vec<PeerStatus>,
    /// None for transports that keep no counters
    pub transport: Option<TransportStats>,
}
