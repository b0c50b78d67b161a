//! In-memory storage backend
//!
//! Keeps stored objects in a map and can be told to fail, which makes it the
//! transport of choice for offline runs and for exercising the queue.

use super::transport::{ProgressFn, ProgressReporter, TransferControl, TransferPayload, UploadTransport};
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// An object as it was stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bytes: Arc<Vec<u8>>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct FailurePlan {
    /// Fail this many upcoming transfers
    fail_next: u32,
    fail_always: bool,
    /// Fail every transfer whose key contains one of these
    failing_patterns: Vec<String>,
}

/// Transport that stores objects in process memory
#[derive(Debug)]
pub struct MemoryTransport {
    objects: Mutex<HashMap<String, StoredObject>>,
    failures: Mutex<FailurePlan>,
    attempts: Mutex<HashMap<String, u32>>,
    chunk_size: usize,
    chunk_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_throttle(64 * 1024, Duration::ZERO)
    }

    /// Delivers `chunk_size` bytes per step and waits `chunk_delay` between steps
    pub fn with_throttle(chunk_size: usize, chunk_delay: Duration) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            failures: Mutex::new(FailurePlan::default()),
            attempts: Mutex::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
            chunk_delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, count: u32) {
        lock(&self.failures).fail_next = count;
    }

    pub fn fail_always(&self, enabled: bool) {
        lock(&self.failures).fail_always = enabled;
    }

    /// Fails every transfer whose destination key contains `pattern`
    pub fn fail_keys_containing(&self, pattern: impl Into<String>) {
        lock(&self.failures).failing_patterns.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        *lock(&self.failures) = FailurePlan::default();
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Number of transfers started for `key`
    pub fn attempts_for(&self, key: &str) -> u32 {
        lock(&self.attempts).get(key).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        lock(&self.attempts).values().sum()
    }

    /// Highest number of transfers that ran at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn address_for(key: &str) -> String {
        format!("memory://{}", key)
    }

    fn should_fail(&self, key: &str) -> bool {
        let mut plan = lock(&self.failures);
        if plan.fail_always || plan.failing_patterns.iter().any(|p| key.contains(p.as_str())) {
            return true;
        }
        if plan.fail_next > 0 {
            plan.fail_next -= 1;
            return true;
        }
        false
    }

    async fn deliver(
        &self,
        payload: &TransferPayload,
        control: &TransferControl,
        on_progress: ProgressFn,
    ) -> Result<(), TransportError> {
        let total = payload.bytes.len();
        let mut reporter = ProgressReporter::new(total, on_progress);
        reporter.report(0);

        let mut sent = 0;
        while sent < total {
            control.checkpoint().await?;
            if !self.chunk_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.chunk_delay) => {}
                    _ = control.cancelled() => return Err(TransportError::Cancelled),
                }
            }
            sent = (sent + self.chunk_size).min(total);
            reporter.report(sent);
        }
        reporter.report(total);
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter however the transfer ends
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UploadTransport for MemoryTransport {
    async fn send(
        &self,
        payload: TransferPayload,
        control: TransferControl,
        on_progress: ProgressFn,
    ) -> Result<String, TransportError> {
        *lock(&self.attempts)
            .entry(payload.destination_key.clone())
            .or_insert(0) += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if self.should_fail(&payload.destination_key) {
            log::debug!("Simulated failure for {}", payload.destination_key);
            return Err(TransportError::Network(format!(
                "simulated network failure for {}",
                payload.destination_key
            )));
        }

        self.deliver(&payload, &control, on_progress).await?;

        let key = payload.destination_key.clone();
        lock(&self.objects).insert(
            key.clone(),
            StoredObject {
                bytes: payload.bytes,
                content_type: payload.content_type,
                metadata: payload.metadata,
            },
        );
        log::debug!("Stored {} in memory", key);
        Ok(Self::address_for(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: &str, len: usize) -> TransferPayload {
        TransferPayload {
            bytes: Arc::new(vec![7; len]),
            destination_key: key.to_string(),
            content_type: "image/jpeg".to_string(),
            metadata: BTreeMap::from([("job_id".to_string(), "j1".to_string())]),
        }
    }

    fn collect() -> (ProgressFn, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |p: u8| sink.lock().unwrap().push(p)), seen)
    }

    #[tokio::test]
    async fn test_send_stores_object() {
        let transport = MemoryTransport::with_throttle(100, Duration::ZERO);
        let (progress, seen) = collect();
        let url = transport
            .send(payload("a/b.jpg", 1000), TransferControl::new(), progress)
            .await
            .unwrap();
        assert_eq!(url, "memory://a/b.jpg");

        let stored = transport.object("a/b.jpg").unwrap();
        assert_eq!(stored.bytes.len(), 1000);
        assert_eq!(stored.metadata["job_id"], "j1");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_same_key_overwrites() {
        let transport = MemoryTransport::new();
        let (progress, _) = collect();
        transport
            .send(payload("k", 10), TransferControl::new(), progress.clone())
            .await
            .unwrap();
        transport
            .send(payload("k", 20), TransferControl::new(), progress)
            .await
            .unwrap();
        assert_eq!(transport.object_count(), 1);
        assert_eq!(transport.object("k").unwrap().bytes.len(), 20);
        assert_eq!(transport.attempts_for("k"), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let transport = MemoryTransport::new();
        transport.fail_next(1);
        transport.fail_keys_containing("_thumb");
        let (progress, _) = collect();

        let first = transport
            .send(payload("a.jpg", 10), TransferControl::new(), progress.clone())
            .await;
        assert!(matches!(first, Err(TransportError::Network(_))));
        assert!(transport
            .send(payload("a.jpg", 10), TransferControl::new(), progress.clone())
            .await
            .is_ok());
        assert!(transport
            .send(payload("a_thumb.jpg", 10), TransferControl::new(), progress)
            .await
            .is_err());
        assert!(transport.object("a_thumb.jpg").is_none());
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer() {
        let transport = Arc::new(MemoryTransport::with_throttle(10, Duration::from_millis(10)));
        let control = TransferControl::new();
        let (progress, _) = collect();

        let t = transport.clone();
        let c = control.clone();
        let handle = tokio::spawn(async move { t.send(payload("x", 1000), c, progress).await });
        tokio::time::sleep(Duration::from_millis(35)).await;
        control.cancel();

        assert_eq!(handle.await.unwrap(), Err(TransportError::Cancelled));
        assert!(transport.object("x").is_none());
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_progress() {
        let transport = Arc::new(MemoryTransport::with_throttle(10, Duration::from_millis(10)));
        let control = TransferControl::new();
        let (progress, seen) = collect();

        let t = transport.clone();
        let c = control.clone();
        let handle = tokio::spawn(async move { t.send(payload("p", 100), c, progress).await });

        tokio::time::sleep(Duration::from_millis(45)).await;
        control.pause();
        tokio::time::sleep(Duration::from_millis(15)).await;
        let frozen = *seen.lock().unwrap().last().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*seen.lock().unwrap().last().unwrap(), frozen);
        assert!(frozen > 0 && frozen < 100);

        control.resume();
        handle.await.unwrap().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&100));
        // never restarted from zero
        assert_eq!(seen.iter().filter(|p| **p == 0).count(), 1);
    }
}
