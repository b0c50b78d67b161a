//! Upload transport contract
//!
//! A transport moves one binary buffer to durable storage and returns the
//! address it can be fetched from. Transfers are steered through a
//! [`TransferControl`] handle: the transport awaits
//! [`TransferControl::checkpoint`] between chunks, which parks the transfer
//! while paused and aborts it once cancelled.

use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Receives transfer progress as a 0..=100 percentage
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// One object to be stored
#[derive(Debug, Clone)]
pub struct TransferPayload {
    pub bytes: Arc<Vec<u8>>,
    /// Storage key; re-sending the same key overwrites the object
    pub destination_key: String,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Transfers `payload` and returns its retrievable address
    async fn send(
        &self,
        payload: TransferPayload,
        control: TransferControl,
        on_progress: ProgressFn,
    ) -> Result<String, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSignal {
    Running,
    Paused,
    Cancelled,
}

/// Shared pause/resume/cancel switch for an in-flight transfer
#[derive(Debug, Clone)]
pub struct TransferControl {
    signal: Arc<watch::Sender<TransferSignal>>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(TransferSignal::Running);
        Self {
            signal: Arc::new(signal),
        }
    }

    pub fn signal(&self) -> TransferSignal {
        *self.signal.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.signal() == TransferSignal::Paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == TransferSignal::Cancelled
    }

    /// Suspends the transfer at its next checkpoint; no-op once cancelled
    pub fn pause(&self) {
        self.signal.send_if_modified(|s| {
            if *s == TransferSignal::Running {
                *s = TransferSignal::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Continues a paused transfer where it stopped
    pub fn resume(&self) {
        self.signal.send_if_modified(|s| {
            if *s == TransferSignal::Paused {
                *s = TransferSignal::Running;
                true
            } else {
                false
            }
        });
    }

    /// Aborts the transfer; cannot be undone
    pub fn cancel(&self) {
        self.signal.send_replace(TransferSignal::Cancelled);
    }

    /// Returns immediately while running, waits while paused, errors once cancelled
    pub async fn checkpoint(&self) -> Result<(), TransportError> {
        let mut rx = self.signal.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                TransferSignal::Running => return Ok(()),
                TransferSignal::Cancelled => return Err(TransportError::Cancelled),
                TransferSignal::Paused => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::Cancelled);
            }
        }
    }

    /// Resolves once the transfer is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        let _ = rx.wait_for(|s| *s == TransferSignal::Cancelled).await;
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns byte counts into monotonic percentages, reporting only changes
pub(crate) struct ProgressReporter {
    total: usize,
    last: Option<u8>,
    on_progress: ProgressFn,
}

impl ProgressReporter {
    pub(crate) fn new(total: usize, on_progress: ProgressFn) -> Self {
        Self {
            total,
            last: None,
            on_progress,
        }
    }

    pub(crate) fn report(&mut self, transferred: usize) {
        let percent = if self.total == 0 {
            100
        } else {
            ((transferred.min(self.total) as u128 * 100) / self.total as u128) as u8
        };
        if self.last.map_or(true, |last| percent > last) {
            self.last = Some(percent);
            (self.on_progress)(percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkpoint_passes_while_running() {
        let control = TransferControl::new();
        assert!(control.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn test_checkpoint_waits_while_paused() {
        let control = TransferControl::new();
        control.pause();
        assert!(control.is_paused());

        let waiting = control.clone();
        let handle = tokio::spawn(async move { waiting.checkpoint().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        control.resume();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_releases_paused_checkpoint() {
        let control = TransferControl::new();
        control.pause();
        let waiting = control.clone();
        let handle = tokio::spawn(async move { waiting.checkpoint().await });
        control.cancel();
        assert_eq!(handle.await.unwrap(), Err(TransportError::Cancelled));

        // cancelled is final
        control.resume();
        control.pause();
        assert!(control.is_cancelled());
        control.cancelled().await;
    }

    #[test]
    fn test_progress_reporter_is_monotonic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut reporter =
            ProgressReporter::new(200, Arc::new(move |p: u8| sink.lock().unwrap().push(p)));
        for transferred in [0, 10, 10, 5, 100, 150, 200, 250] {
            reporter.report(transferred);
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 5, 50, 75, 100]);
    }

    #[test]
    fn test_progress_reporter_empty_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut reporter = ProgressReporter::new(0, Arc::new(move |p: u8| sink.lock().unwrap().push(p)));
        reporter.report(0);
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }
}
