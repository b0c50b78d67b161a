use super::queue_item::QueueItem;
use serde::Serialize;

/// Read-only snapshot of the whole queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    /// In insertion order
    pub items: Vec<QueueItem>,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    /// Items in `compressing` or `uploading`
    pub active_items: usize,
    /// Items waiting for a slot (`pending` or `error`)
    pub pending_items: usize,
    pub is_processing: bool,
    pub is_paused: bool,
    pub max_concurrent_uploads: usize,
}

/// Aggregate counters published on every transition
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub active: usize,
}
