//! Topic-keyed fan-out for messages nobody asked for.
//!
//! The control channel publishes every frame that does not settle a pending
//! request here, keyed by the frame's `type`. Subscribers get a broadcast
//! receiver; dropping a topic closes every receiver attached to it.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::broadcast;

pub const DEFAULT_TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no subscribers for topic {0}")]
    NoSubscribers(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<PushMessage>;

    /// Delivers to current subscribers and returns how many received it.
    /// Publishing never creates a topic.
    fn publish(&self, topic: &str, payload: Value) -> BusResult<usize>;

    /// Drops the topic; attached receivers observe `RecvError::Closed`.
    fn unsubscribe(&self, topic: &str) -> bool;

    fn has_subscribers(&self, topic: &str) -> bool;
}

/// In-process bus backed by one broadcast channel per topic.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<PushMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Drops every topic at once.
    pub fn clear(&self) {
        self.topics.write().clear();
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<PushMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    fn publish(&self, topic: &str, payload: Value) -> BusResult<usize> {
        let sender = self
            .topics
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| BusError::NoSubscribers(topic.to_string()))?;
        let message = PushMessage {
            topic: topic.to_string(),
            payload,
        };
        match sender.send(message) {
            Ok(delivered) => Ok(delivered),
            Err(_) => {
                // every receiver was dropped; forget the topic
                let mut guard = self.topics.write();
                if guard
                    .get(topic)
                    .is_some_and(|current| current.receiver_count() == 0)
                {
                    guard.remove(topic);
                }
                Err(BusError::NoSubscribers(topic.to_string()))
            }
        }
    }

    fn unsubscribe(&self, topic: &str) -> bool {
        self.topics.write().remove(topic).is_some()
    }

    fn has_subscribers(&self, topic: &str) -> bool {
        self.topics
            .read()
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() > 0)
    }
}
