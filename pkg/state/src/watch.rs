use pkg_constants::state::{NODES_PREFIX, PODS_PREFIX, WATCH_CHANNEL_CAPACITY};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

/// Type of event in the watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// Object kind a registry key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Node,
    Pod,
}

/// A single watch event representing a state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub seq: u64,
    pub event_type: EventType,
    pub key: String,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
}

impl WatchEvent {
    pub fn kind(&self) -> Option<ResourceKind> {
        if self.key.starts_with(NODES_PREFIX) {
            Some(ResourceKind::Node)
        } else if self.key.starts_with(PODS_PREFIX) {
            Some(ResourceKind::Pod)
        } else {
            None
        }
    }
}

/// In-memory event log that stamps every state mutation with a monotonic
/// sequence number and fans it out to live subscribers.
#[derive(Clone)]
pub struct EventLog {
    seq: Arc<RwLock<u64>>,
    sender: broadcast::Sender<WatchEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            seq: Arc::new(RwLock::new(0)),
            sender,
        }
    }

    /// Record a new event. Called by StateStore on put/delete.
    pub async fn emit(&self, event_type: EventType, key: String, value: Option<Vec<u8>>) -> u64 {
        let mut seq = self.seq.write().await;
        *seq += 1;
        let event = WatchEvent {
            seq: *seq,
            event_type,
            key,
            value,
        };
        // No receivers is fine; the scheduler may not have started yet.
        let _ = self.sender.send(event);
        *seq
    }

    /// Sequence number of the last emitted event. Every event at or below it
    /// was emitted after its write reached the store.
    pub async fn current_seq(&self) -> u64 {
        *self.seq.read().await
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
