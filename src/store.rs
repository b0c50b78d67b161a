//! In-memory item store
//!
//! Ordered mapping from item id to [`QueueItem`]. Aggregate counters are
//! adjusted on every status change instead of being recounted, so each
//! transition costs O(1).

use crate::models::{ItemStatus, QueueItem, QueueProgress};
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct QueueStore {
    order: Vec<String>,
    items: HashMap<String, QueueItem>,
    completed: usize,
    failed: usize,
    active: usize,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: QueueItem) {
        if let Some(previous) = self.items.get(&item.id) {
            // ids are unique; a duplicate insert replaces the record in place
            let status = previous.status;
            self.count(status, -1);
        } else {
            self.order.push(item.id.clone());
        }
        self.count(item.status, 1);
        self.items.insert(item.id.clone(), item);
    }

    pub fn get(&self, id: &str) -> Option<&QueueItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Mutates one item without touching its status
    pub fn update<R>(&mut self, id: &str, f: impl FnOnce(&mut QueueItem) -> R) -> Option<R> {
        let item = self.items.get_mut(id)?;
        let status = item.status;
        let result = f(item);
        // status changes go through set_status so the counters stay right
        item.status = status;
        Some(result)
    }

    /// Moves an item to `status`, returning the previous status
    pub fn set_status(&mut self, id: &str, status: ItemStatus) -> Option<ItemStatus> {
        let item = self.items.get_mut(id)?;
        let previous = item.status;
        if previous == status {
            return Some(previous);
        }
        item.status = status;
        self.count(previous, -1);
        self.count(status, 1);
        Some(previous)
    }

    pub fn remove(&mut self, id: &str) -> Option<QueueItem> {
        let item = self.items.remove(id)?;
        self.order.retain(|other| other != id);
        self.count(item.status, -1);
        Some(item)
    }

    /// Removes every item in `status`, returning how many were removed
    pub fn remove_with_status(&mut self, status: ItemStatus) -> usize {
        let ids: Vec<String> = self
            .iter()
            .filter(|item| item.status == status)
            .map(|item| item.id.clone())
            .collect();
        for id in &ids {
            self.remove(id);
        }
        ids.len()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Items in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &QueueItem> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }

    /// Items that may start now: `pending`, or `error` whose backoff has elapsed
    pub fn startable(&self, now: Instant, limit: usize) -> Vec<String> {
        self.iter()
            .filter(|item| match item.status {
                ItemStatus::Pending => true,
                ItemStatus::Error => item.next_attempt_at.map_or(true, |at| at <= now),
                _ => false,
            })
            .take(limit)
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn ids_with_status(&self, status: ItemStatus) -> Vec<String> {
        self.iter()
            .filter(|item| item.status == status)
            .map(|item| item.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn completed_count(&self) -> usize {
        self.completed
    }

    pub fn failed_count(&self) -> usize {
        self.failed
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Items not in a terminal state
    pub fn unfinished_count(&self) -> usize {
        self.len() - self.completed - self.failed
    }

    pub fn progress(&self) -> QueueProgress {
        QueueProgress {
            total: self.len(),
            completed: self.completed,
            failed: self.failed,
            active: self.active,
        }
    }

    fn count(&mut self, status: ItemStatus, delta: isize) {
        let counter = match status {
            ItemStatus::Completed => &mut self.completed,
            ItemStatus::Failed => &mut self.failed,
            ItemStatus::Compressing | ItemStatus::Uploading => &mut self.active,
            ItemStatus::Pending | ItemStatus::Error => return,
        };
        *counter = counter.saturating_add_signed(delta);
    }
}
