//! Gossip propagation: a bounded seen-set/message store, fanout peer
//! selection, and the engine that floods messages and runs anti-entropy.
pub mod engine;
pub mod selection;
pub mod store;

pub use engine::GossipEngine;
pub use selection::{FixedSelector, PeerSelector, RandomSelector};
pub use store::MessageStore;
