//! Queue lifecycle events, fanned out over a `tokio::sync::broadcast` channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffer capacity for the broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventKind {
    Added,
    CompressionStart,
    CompressionComplete,
    UploadStart,
    UploadProgress,
    UploadComplete,
    UploadError,
    Retry,
    Failed,
    QueueComplete,
}

/// Something that happened to an item (or to the queue as a whole)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    /// `None` only for queue-wide events
    pub item_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl QueueEvent {
    pub fn new(kind: QueueEventKind, item_id: Option<String>) -> Self {
        Self {
            kind,
            item_id,
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn for_item(kind: QueueEventKind, item_id: &str) -> Self {
        Self::new(kind, Some(item_id.to_string()))
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// In-process fan-out of [`QueueEvent`]s.
///
/// Slow subscribers lose the oldest events and observe
/// `RecvError::Lagged`; the queue itself never blocks on them.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: QueueEvent) {
        log::trace!("Queue event {:?} for {:?}", event.kind, event.item_id);
        // Ignore the SendError, it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
