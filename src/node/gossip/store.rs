//! Seen set and message store.
//!
//! Both live in one structure so that "have I seen it" and "mark it seen"
//! happen under a single lock. Capacity is bounded; the oldest ids are
//! forgotten first.
//!
//! Forgetting an id must not make it acceptable again, or anti-entropy
//! with a peer that still remembers it would hand it back forever. Each
//! eviction raises a horizon to the newest origin timestamp evicted so
//! far, and anything stamped at or below the horizon counts as seen.
use std::collections::{HashMap, HashSet, VecDeque};

use crate::node::messages::{Message, MsgId, SeenDigest};

#[derive(Debug)]
struct Entry {
    // None for ids restored from a log line that carried no timestamp
    timestamp: Option<f64>,
    // None for ids known only from the persisted seen log
    body: Option<Message>,
}

#[derive(Debug)]
pub struct MessageStore {
    capacity: usize,
    // Oldest first
    order: VecDeque<MsgId>,
    entries: HashMap<MsgId, Entry>,
    horizon: f64,
}

impl MessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
            horizon: f64::NEG_INFINITY,
        }
    }

    /// Mark the message seen and keep its body. Returns false if it was
    /// already seen or falls at or below the horizon, in which case
    /// nothing changes.
    pub fn insert(&mut self, message: &Message) -> bool {
        self.admit(message.msg_id, Some(message.timestamp), Some(message.clone()))
    }

    /// Mark an id seen without a body
    pub fn mark_seen(&mut self, msg_id: MsgId, timestamp: Option<f64>) -> bool {
        self.admit(msg_id, timestamp, None)
    }

    fn admit(&mut self, msg_id: MsgId, timestamp: Option<f64>, body: Option<Message>) -> bool {
        if self.entries.contains_key(&msg_id) || self.is_expired(timestamp) {
            return false;
        }
        self.entries.insert(msg_id, Entry { timestamp, body });
        self.order.push_back(msg_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                if let Some(Entry {
                    timestamp: Some(t), ..
                }) = self.entries.remove(&oldest)
                {
                    self.raise_horizon(t);
                }
            }
        }
        true
    }

    fn is_expired(&self, timestamp: Option<f64>) -> bool {
        matches!(timestamp, Some(t) if t <= self.horizon)
    }

    /// Raise the horizon to at least `timestamp`; it never moves back
    pub fn raise_horizon(&mut self, timestamp: f64) {
        if timestamp > self.horizon {
            self.horizon = timestamp;
        }
    }

    /// Newest origin timestamp among evicted ids
    pub fn horizon(&self) -> f64 {
        self.horizon
    }

    pub fn contains(&self, msg_id: &MsgId) -> bool {
        self.entries.contains_key(msg_id)
    }

    pub fn get(&self, msg_id: &MsgId) -> Option<&Message> {
        self.entries.get(msg_id).and_then(|entry| entry.body.as_ref())
    }

    /// Held ids with their timestamps, oldest first
    pub fn retained(&self) -> Vec<(MsgId, Option<f64>)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| (*id, entry.timestamp)))
            .collect()
    }

    /// What a peer needs to know to resend only what we could still accept.
    /// Ids at or below the horizon are implied by it and left out.
    pub fn digest(&self) -> SeenDigest {
        let msg_ids = self
            .order
            .iter()
            .filter(|id| {
                self.entries
                    .get(*id)
                    .map_or(false, |entry| !self.is_expired(entry.timestamp))
            })
            .copied()
            .collect();
        SeenDigest::new(self.horizon, msg_ids)
    }

    /// Held ids not in `theirs`, oldest first
    pub fn missing_from(&self, theirs: &HashSet<MsgId>) -> Vec<MsgId> {
        self.order
            .iter()
            .filter(|id| !theirs.contains(*id))
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
