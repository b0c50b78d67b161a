//! Upload queue coordinator
//!
//! Photos are admitted as `pending` and driven through compression and upload
//! by one scheduling loop that keeps at most `max_concurrent_uploads` items
//! active. Each admitted item runs as its own tokio task; failures are turned
//! into a retry with exponential backoff or a terminal `failed` state.
//!
//! All item mutations and event emissions happen under one lock, and only
//! for items still present in the store, so a cancelled item never produces
//! another event.

use super::transport::{ProgressFn, TransferControl, TransferPayload, UploadTransport};
use super::webdav_transport::WebDavTransport;
use crate::config::{PipelineConfig, QueueConfig};
use crate::error::{PipelineError, QueueError};
use crate::events::{EventBus, QueueEvent, QueueEventKind};
use crate::models::{
    CompressedArtifacts, ItemStatus, PhotoInput, QueueItem, QueueProgress, QueueState,
    UploadedPhoto,
};
use crate::store::QueueStore;
use chrono::Utc;
use photo_compress::{CompressedImage, CompressionError, Compressor};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Runs the CPU-bound compressor on tokio's blocking pool
pub async fn compress_async(
    compressor: Compressor,
    raw: Arc<Vec<u8>>,
) -> Result<CompressedImage, CompressionError> {
    tokio::task::spawn_blocking(move || compressor.compress(&raw))
        .await
        .map_err(|e| CompressionError::Surface(format!("compression task failed: {}", e)))?
}

/// Handle to an upload queue; clones share the same queue
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    compressor: Compressor,
    transport: Arc<dyn UploadTransport>,
    runtime: Handle,
    state: Mutex<SchedulerState>,
    events: EventBus,
    progress: watch::Sender<QueueProgress>,
    idle: watch::Sender<bool>,
}

#[derive(Default)]
struct SchedulerState {
    store: QueueStore,
    is_processing: bool,
    is_paused: bool,
    /// Running attempt per active item
    tasks: HashMap<String, ActiveTask>,
    /// Bumped by `clear` so a stale scheduling loop stops quietly
    generation: u64,
    attempt_counter: u64,
}

struct ActiveTask {
    control: TransferControl,
    abort: AbortHandle,
    attempt: u64,
}

enum Source {
    Raw(Arc<Vec<u8>>),
    Compressed(CompressedArtifacts),
}

impl UploadQueue {
    /// Creates an empty queue; must be called from within a tokio runtime
    pub fn new(
        config: QueueConfig,
        compressor: Compressor,
        transport: Arc<dyn UploadTransport>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| QueueError::Runtime(e.to_string()))?;
        let (progress, _) = watch::channel(QueueProgress::default());
        let (idle, _) = watch::channel(true);

        log::debug!(
            "Upload queue ready (max {} concurrent, {} retries)",
            config.max_concurrent_uploads,
            config.max_retries
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                events: EventBus::new(config.event_capacity),
                config,
                compressor,
                transport,
                runtime,
                state: Mutex::new(SchedulerState::default()),
                progress,
                idle,
            }),
        })
    }

    /// Queue uploading to the configured WebDAV server
    pub fn from_config(config: &PipelineConfig) -> Result<Self, QueueError> {
        config.validate()?;
        let webdav = config
            .webdav
            .clone()
            .ok_or_else(|| QueueError::Config("no storage backend configured".to_string()))?;
        let transport = WebDavTransport::new(webdav)?;
        let profile = config.profile.resolve();
        log::info!(
            "Using compression profile {}x{} @ {:.1}",
            profile.max_width,
            profile.max_height,
            profile.quality
        );
        Self::new(
            config.queue.clone(),
            Compressor::new(profile),
            Arc::new(transport),
        )
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Admits one photo and returns its id
    pub fn add_photo(&self, input: PhotoInput) -> String {
        let mut state = self.inner.lock();
        let id = self.inner.admit(&mut state, input);
        self.inner.kick(&mut state);
        id
    }

    /// Admits several photos in order and returns their ids
    pub fn add_multiple_photos(&self, inputs: Vec<PhotoInput>) -> Vec<String> {
        let mut state = self.inner.lock();
        let ids: Vec<String> = inputs
            .into_iter()
            .map(|input| self.inner.admit(&mut state, input))
            .collect();
        self.inner.kick(&mut state);
        ids
    }

    /// Suspends running transfers in place and stops admitting new items
    pub fn pause(&self) {
        let mut state = self.inner.lock();
        if state.is_paused {
            return;
        }
        state.is_paused = true;
        for task in state.tasks.values() {
            task.control.pause();
        }
        log::info!("Upload queue paused ({} active)", state.tasks.len());
    }

    pub fn resume(&self) {
        let mut state = self.inner.lock();
        if !state.is_paused {
            return;
        }
        state.is_paused = false;
        for task in state.tasks.values() {
            task.control.resume();
        }
        log::info!("Upload queue resumed");
        self.inner.kick(&mut state);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().is_paused
    }

    /// Aborts the item's transfer if one is running and removes it from the queue
    pub fn cancel_item(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        if let Some(task) = state.tasks.remove(id) {
            task.control.cancel();
            task.abort.abort();
        }
        let item = state
            .store
            .remove(id)
            .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
        log::info!("Cancelled {} ({})", item.original_name, id);
        self.inner.publish_progress(&state);
        Ok(())
    }

    /// Gives a failed item a fresh set of retries
    pub fn retry_item(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        let status = state
            .store
            .get(id)
            .map(|item| item.status)
            .ok_or_else(|| QueueError::ItemNotFound(id.to_string()))?;
        if status != ItemStatus::Failed {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                status,
            });
        }
        self.inner.reset_failed(&mut state, id);
        self.inner.kick(&mut state);
        Ok(())
    }

    /// Retries every failed item, returning their ids
    pub fn retry_all_failed(&self) -> Vec<String> {
        let mut state = self.inner.lock();
        let ids = state.store.ids_with_status(ItemStatus::Failed);
        for id in &ids {
            self.inner.reset_failed(&mut state, id);
        }
        if !ids.is_empty() {
            log::info!("Retrying {} failed uploads", ids.len());
            self.inner.kick(&mut state);
        }
        ids
    }

    /// Aborts everything and empties the queue
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        for (_, task) in state.tasks.drain() {
            task.control.cancel();
            task.abort.abort();
        }
        state.store.clear();
        state.generation += 1;
        state.is_processing = false;
        state.is_paused = false;
        self.inner.idle.send_replace(true);
        self.inner.publish_progress(&state);
        log::info!("Upload queue cleared");
    }

    /// Drops completed items, returning how many were removed
    pub fn clear_completed(&self) -> usize {
        let mut state = self.inner.lock();
        let removed = state.store.remove_with_status(ItemStatus::Completed);
        self.inner.publish_progress(&state);
        removed
    }

    pub fn get_state(&self) -> QueueState {
        let state = self.inner.lock();
        let store = &state.store;
        QueueState {
            items: store.iter().cloned().collect(),
            total_items: store.len(),
            completed_items: store.completed_count(),
            failed_items: store.failed_count(),
            active_items: store.active_count(),
            pending_items: store.unfinished_count().saturating_sub(store.active_count()),
            is_processing: state.is_processing,
            is_paused: state.is_paused,
            max_concurrent_uploads: self.inner.config.max_concurrent_uploads,
        }
    }

    pub fn get_items(&self) -> Vec<QueueItem> {
        self.inner.lock().store.iter().cloned().collect()
    }

    pub fn get_item(&self, id: &str) -> Option<QueueItem> {
        self.inner.lock().store.get(id).cloned()
    }

    /// Completed uploads, ready to be attached to their job records
    pub fn get_uploaded_photos(&self) -> Vec<UploadedPhoto> {
        self.inner
            .lock()
            .store
            .iter()
            .filter_map(UploadedPhoto::from_item)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<QueueProgress> {
        self.inner.progress.subscribe()
    }

    /// Resolves once the scheduling loop has stopped, either because every
    /// item is terminal or because the queue is paused
    pub async fn wait_until_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

impl std::fmt::Debug for UploadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueue")
            .field("config", &self.inner.config)
            .field("progress", &*self.inner.progress.borrow())
            .finish_non_exhaustive()
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        self.events.publish(event);
    }

    fn publish_progress(&self, state: &SchedulerState) {
        let current = state.store.progress();
        self.progress.send_if_modified(|progress| {
            if *progress == current {
                false
            } else {
                *progress = current;
                true
            }
        });
    }

    fn is_current(state: &SchedulerState, id: &str, attempt: u64) -> bool {
        state
            .tasks
            .get(id)
            .map_or(false, |task| task.attempt == attempt)
    }

    fn admit(&self, state: &mut SchedulerState, input: PhotoInput) -> String {
        let item = QueueItem::new(input, self.config.max_retries);
        let id = item.id.clone();
        log::info!(
            "Queued {} ({} bytes) for job {}",
            item.original_name,
            item.original_size,
            item.metadata.job_id
        );
        self.emit(
            QueueEvent::for_item(QueueEventKind::Added, &id).with_data(json!({
                "original_name": item.original_name,
                "original_size": item.original_size,
                "job_id": item.metadata.job_id,
                "category": item.metadata.category.as_str(),
            })),
        );
        state.store.insert(item);
        self.publish_progress(state);
        id
    }

    fn reset_failed(&self, state: &mut SchedulerState, id: &str) {
        state.store.set_status(id, ItemStatus::Pending);
        state.store.update(id, |item| {
            item.retry_count = 0;
            item.error = None;
            item.progress = 0;
            item.next_attempt_at = None;
        });
        self.emit(
            QueueEvent::for_item(QueueEventKind::Retry, id)
                .with_data(json!({ "retry_count": 0, "manual": true })),
        );
        self.publish_progress(state);
    }

    /// Starts the scheduling loop unless it is running or the queue is paused
    fn kick(self: &Arc<Self>, state: &mut SchedulerState) {
        if state.is_processing || state.is_paused {
            return;
        }
        state.is_processing = true;
        self.idle.send_replace(false);
        let inner = self.clone();
        let generation = state.generation;
        self.runtime.spawn(async move { inner.run(generation).await });
    }

    async fn run(self: Arc<Self>, generation: u64) {
        log::debug!("Scheduling loop started");
        loop {
            {
                let mut state = self.lock();
                if state.generation != generation {
                    return;
                }
                if state.is_paused {
                    state.is_processing = false;
                    self.idle.send_replace(true);
                    log::debug!("Scheduling loop stopped while paused");
                    return;
                }

                let free = self
                    .config
                    .max_concurrent_uploads
                    .saturating_sub(state.store.active_count());
                if free > 0 {
                    for id in state.store.startable(Instant::now(), free) {
                        self.start_item(&mut state, &id);
                    }
                }

                if state.store.unfinished_count() == 0 {
                    state.is_processing = false;
                    let progress = state.store.progress();
                    log::info!(
                        "Upload queue drained: {} completed, {} failed",
                        progress.completed,
                        progress.failed
                    );
                    self.emit(QueueEvent::new(QueueEventKind::QueueComplete, None).with_data(
                        json!({ "completed": progress.completed, "failed": progress.failed }),
                    ));
                    self.idle.send_replace(true);
                    return;
                }
            }
            tokio::time::sleep(self.config.tick_interval()).await;
        }
    }

    fn start_item(self: &Arc<Self>, state: &mut SchedulerState, id: &str) {
        let Some(previous) = state.store.set_status(id, ItemStatus::Compressing) else {
            return;
        };
        if previous == ItemStatus::Error {
            let retry_count = state.store.get(id).map_or(0, |item| item.retry_count);
            log::debug!("Retrying {} (attempt {})", id, retry_count + 1);
            self.emit(
                QueueEvent::for_item(QueueEventKind::Retry, id)
                    .with_data(json!({ "retry_count": retry_count, "manual": false })),
            );
        }
        state.store.update(id, |item| {
            item.next_attempt_at = None;
            item.progress = 0;
        });

        state.attempt_counter += 1;
        let attempt = state.attempt_counter;
        let control = TransferControl::new();
        let inner = self.clone();
        let task_control = control.clone();
        let task_id = id.to_string();
        let handle = self.runtime.spawn(async move {
            let result = inner.run_attempt(&task_id, attempt, &task_control).await;
            inner.finish_attempt(&task_id, attempt, result);
        });

        state.tasks.insert(
            id.to_string(),
            ActiveTask {
                control,
                abort: handle.abort_handle(),
                attempt,
            },
        );
        self.publish_progress(state);
    }

    /// Compress (first attempt only), then upload main image and thumbnail
    async fn run_attempt(
        self: &Arc<Self>,
        id: &str,
        attempt: u64,
        control: &TransferControl,
    ) -> Result<(String, String), PipelineError> {
        let source = {
            let state = self.lock();
            let item = state.store.get(id).ok_or(PipelineError::Removed)?;
            match (&item.artifacts, &item.original) {
                (Some(artifacts), _) => Source::Compressed(artifacts.clone()),
                (None, Some(original)) => Source::Raw(original.clone()),
                (None, None) => {
                    return Err(CompressionError::Decode("no image data".to_string()).into())
                }
            }
        };

        let artifacts = match source {
            Source::Compressed(artifacts) => artifacts,
            Source::Raw(raw) => self.compress_item(id, attempt, raw).await?,
        };

        let (main, thumbnail) = self.begin_upload(id, attempt, &artifacts)?;
        let main_len = main.bytes.len();
        let total = main_len + thumbnail.bytes.len();

        let main_url = self
            .transport
            .send(
                main,
                control.clone(),
                self.progress_callback(id, attempt, 0, main_len, total),
            )
            .await?;
        let thumbnail_url = self
            .transport
            .send(
                thumbnail,
                control.clone(),
                self.progress_callback(id, attempt, main_len, total - main_len, total),
            )
            .await?;

        Ok((main_url, thumbnail_url))
    }

    async fn compress_item(
        &self,
        id: &str,
        attempt: u64,
        raw: Arc<Vec<u8>>,
    ) -> Result<CompressedArtifacts, PipelineError> {
        {
            let state = self.lock();
            if !Self::is_current(&state, id, attempt) {
                return Err(PipelineError::Removed);
            }
            self.emit(
                QueueEvent::for_item(QueueEventKind::CompressionStart, id)
                    .with_data(json!({ "original_size": raw.len() })),
            );
        }

        let original_size = raw.len();
        let image = compress_async(self.compressor.clone(), raw).await?;
        log::debug!(
            "Compressed {}: {} -> {} bytes ({}x{}, quality {:.1}, thumbnail {} bytes)",
            id,
            original_size,
            image.main_size,
            image.width,
            image.height,
            image.quality_used,
            image.thumbnail_size
        );

        let mut state = self.lock();
        if !Self::is_current(&state, id, attempt) {
            return Err(PipelineError::Removed);
        }
        let data = json!({
            "original_size": original_size,
            "compressed_size": image.main_size,
            "thumbnail_size": image.thumbnail_size,
            "width": image.width,
            "height": image.height,
            "quality": image.quality_used,
        });
        let artifacts = state
            .store
            .update(id, |item| {
                item.set_artifacts(image);
                item.artifacts.clone()
            })
            .flatten()
            .ok_or(PipelineError::Removed)?;
        self.emit(QueueEvent::for_item(QueueEventKind::CompressionComplete, id).with_data(data));
        Ok(artifacts)
    }

    /// Moves the item to `uploading` and builds both payloads
    fn begin_upload(
        &self,
        id: &str,
        attempt: u64,
        artifacts: &CompressedArtifacts,
    ) -> Result<(TransferPayload, TransferPayload), PipelineError> {
        let mut state = self.lock();
        if !Self::is_current(&state, id, attempt) {
            return Err(PipelineError::Removed);
        }
        state.store.set_status(id, ItemStatus::Uploading);
        let payloads = state
            .store
            .update(id, |item| {
                if item.started_at.is_none() {
                    item.started_at = Some(Utc::now());
                }
                item.progress = 0;

                let (main_key, thumbnail_key) = item.destination_keys(artifacts.encoding);
                let mut metadata = item.metadata.to_storage_map();
                metadata.insert("original_name".to_string(), item.original_name.clone());
                let content_type = artifacts.encoding.content_type().to_string();
                (
                    TransferPayload {
                        bytes: artifacts.main.clone(),
                        destination_key: main_key,
                        content_type: content_type.clone(),
                        metadata: metadata.clone(),
                    },
                    TransferPayload {
                        bytes: artifacts.thumbnail.clone(),
                        destination_key: thumbnail_key,
                        content_type,
                        metadata,
                    },
                )
            })
            .ok_or(PipelineError::Removed)?;

        log::debug!("{} -> uploading", id);
        self.emit(
            QueueEvent::for_item(QueueEventKind::UploadStart, id).with_data(json!({
                "destination_key": payloads.0.destination_key,
                "size": payloads.0.bytes.len() + payloads.1.bytes.len(),
            })),
        );
        self.publish_progress(&state);
        Ok(payloads)
    }

    /// Maps one artifact's transfer percentage onto the item's byte-weighted progress
    fn progress_callback(
        self: &Arc<Self>,
        id: &str,
        attempt: u64,
        offset: usize,
        length: usize,
        total: usize,
    ) -> ProgressFn {
        let inner = Arc::downgrade(self);
        let id = id.to_string();
        Arc::new(move |percent: u8| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let overall = if total == 0 {
                100
            } else {
                let transferred = offset + length * usize::from(percent) / 100;
                (transferred * 100 / total).min(100) as u8
            };
            inner.record_progress(&id, attempt, overall);
        })
    }

    fn record_progress(&self, id: &str, attempt: u64, progress: u8) {
        let mut state = self.lock();
        if !Self::is_current(&state, id, attempt) {
            return;
        }
        let advanced = state
            .store
            .update(id, |item| {
                if item.status == ItemStatus::Uploading && progress > item.progress {
                    item.progress = progress;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if advanced {
            self.emit(
                QueueEvent::for_item(QueueEventKind::UploadProgress, id)
                    .with_data(json!({ "progress": progress })),
            );
        }
    }

    fn finish_attempt(
        &self,
        id: &str,
        attempt: u64,
        result: Result<(String, String), PipelineError>,
    ) {
        let mut state = self.lock();
        if !Self::is_current(&state, id, attempt) {
            return;
        }
        state.tasks.remove(id);
        if !state.store.contains(id) {
            return;
        }

        match result {
            Ok((url, thumbnail_url)) => {
                state.store.set_status(id, ItemStatus::Completed);
                state.store.update(id, |item| {
                    item.uploaded_url = Some(url.clone());
                    item.uploaded_thumbnail_url = Some(thumbnail_url.clone());
                    item.completed_at = Some(Utc::now());
                    item.progress = 100;
                    item.error = None;
                });
                log::info!("Upload complete: {}", url);
                self.emit(
                    QueueEvent::for_item(QueueEventKind::UploadComplete, id).with_data(json!({
                        "url": url,
                        "thumbnail_url": thumbnail_url,
                    })),
                );
            }
            Err(e) if e.is_cancelled() => {
                log::debug!("{} attempt cancelled, back to pending", id);
                state.store.set_status(id, ItemStatus::Pending);
                state.store.update(id, |item| item.progress = 0);
            }
            Err(e) => self.record_failure(&mut state, id, &e),
        }
        self.publish_progress(&state);
    }

    fn record_failure(&self, state: &mut SchedulerState, id: &str, error: &PipelineError) {
        let Some((retry_count, max_retries)) = state.store.update(id, |item| {
            item.retry_count = (item.retry_count + 1).min(item.max_retries);
            item.error = Some(error.to_string());
            (item.retry_count, item.max_retries)
        }) else {
            return;
        };

        self.emit(
            QueueEvent::for_item(QueueEventKind::UploadError, id).with_data(json!({
                "error": error.to_string(),
                "message": error.user_message(),
                "retry_count": retry_count,
            })),
        );

        if error.is_permanent() || retry_count >= max_retries {
            state.store.set_status(id, ItemStatus::Failed);
            state.store.update(id, |item| item.next_attempt_at = None);
            log::error!(
                "Upload of {} failed after {} attempt(s): {}",
                id,
                retry_count,
                error
            );
            self.emit(
                QueueEvent::for_item(QueueEventKind::Failed, id).with_data(json!({
                    "error": error.to_string(),
                    "retry_count": retry_count,
                })),
            );
        } else {
            let delay = self.config.backoff_delay(retry_count);
            state.store.set_status(id, ItemStatus::Error);
            state
                .store
                .update(id, |item| item.next_attempt_at = Some(Instant::now() + delay));
            log::warn!(
                "Upload of {} failed ({}), retry {}/{} in {:?}",
                id,
                error,
                retry_count,
                max_retries,
                delay
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::models::{PhotoCategory, PhotoMetadata};
    use crate::services::memory_transport::MemoryTransport;
    use async_trait::async_trait;
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};
    use photo_compress::{CompressionProfile, OutputEncoding};
    use std::time::Duration;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn test_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x % 256) as u8,
                (y % 256) as u8,
                ((x * 7 + y * 13) % 256) as u8,
            ])
        });
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 95)
            .encode_image(&img)
            .unwrap();
        out
    }

    fn photo(job_id: &str) -> PhotoInput {
        PhotoInput::new(
            test_jpeg(320, 240),
            "IMG_0001.jpg",
            PhotoMetadata::new(job_id, PhotoCategory::After).with_room("Kitchen"),
        )
    }

    fn queue_with(config: QueueConfig, transport: Arc<MemoryTransport>) -> UploadQueue {
        UploadQueue::new(
            config,
            Compressor::new(CompressionProfile::standard()),
            transport,
        )
        .unwrap()
    }

    fn retries(max_retries: u32) -> QueueConfig {
        QueueConfig {
            max_retries,
            ..Default::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn settle(queue: &UploadQueue) {
        tokio::time::timeout(Duration::from_secs(600), queue.wait_until_idle())
            .await
            .expect("queue did not settle");
    }

    async fn wait_for_upload(queue: &UploadQueue, id: &str) {
        for _ in 0..10_000 {
            if let Some(item) = queue.get_item(id) {
                if item.status == ItemStatus::Uploading && item.progress > 0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("item never started uploading");
    }

    /// Records when each transfer started, in tokio time
    struct RecordingTransport {
        inner: MemoryTransport,
        started: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl UploadTransport for RecordingTransport {
        async fn send(
            &self,
            payload: TransferPayload,
            control: TransferControl,
            on_progress: ProgressFn,
        ) -> Result<String, TransportError> {
            self.started.lock().unwrap().push(Instant::now());
            self.inner.send(payload, control, on_progress).await
        }
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = UploadQueue::new(
            QueueConfig::default(),
            Compressor::new(CompressionProfile::standard()),
            Arc::new(MemoryTransport::new()),
        );
        assert!(matches!(result, Err(QueueError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = QueueConfig {
            max_concurrent_uploads: 0,
            ..Default::default()
        };
        let result = UploadQueue::new(
            config,
            Compressor::new(CompressionProfile::standard()),
            Arc::new(MemoryTransport::new()),
        );
        assert!(matches!(result, Err(QueueError::Config(_))));
    }

    #[tokio::test]
    async fn test_from_config_requires_backend() {
        assert!(matches!(
            UploadQueue::from_config(&PipelineConfig::default()),
            Err(QueueError::Config(_))
        ));

        let config = PipelineConfig::from_toml_str(
            r#"
            [webdav]
            server_url = "https://cloud.example.com"
            username = "operator"
            app_password = "secret"
            remote_path = "/FieldPhotos"

            [profile]
            mode = "reduced"
            "#,
        )
        .unwrap();
        let queue = UploadQueue::from_config(&config).unwrap();
        assert_eq!(queue.config().max_concurrent_uploads, 2);
        assert_eq!(queue.get_state().total_items, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_photo_lifecycle() {
        init_logger();
        let transport = Arc::new(MemoryTransport::new());
        let queue = queue_with(QueueConfig::default(), transport.clone());
        let mut events = queue.subscribe();

        let id = queue.add_photo(photo("job-7"));
        settle(&queue).await;

        let item = queue.get_item(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.progress, 100);
        assert_eq!(item.retry_count, 0);
        assert!(item.started_at.is_some());
        assert!(item.completed_at.is_some());
        assert!(!item.holds_original());
        assert!(item.thumbnail_data_uri.as_deref().unwrap().starts_with("data:image/jpeg;base64,"));

        let (main_key, thumb_key) = item.destination_keys(OutputEncoding::Jpeg);
        assert_eq!(item.uploaded_url.as_deref(), Some(format!("memory://{}", main_key).as_str()));
        assert_eq!(
            item.uploaded_thumbnail_url.as_deref(),
            Some(format!("memory://{}", thumb_key).as_str())
        );
        let stored = transport.object(&main_key).unwrap();
        assert_eq!(stored.content_type, "image/jpeg");
        assert_eq!(stored.metadata["job_id"], "job-7");
        assert_eq!(stored.metadata["room_label"], "Kitchen");
        assert_eq!(stored.metadata["original_name"], "IMG_0001.jpg");
        assert_eq!(stored.bytes.len(), item.compressed_size.unwrap());

        let kinds: Vec<QueueEventKind> = drain(&mut events)
            .into_iter()
            .filter(|e| e.kind != QueueEventKind::UploadProgress)
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                QueueEventKind::Added,
                QueueEventKind::CompressionStart,
                QueueEventKind::CompressionComplete,
                QueueEventKind::UploadStart,
                QueueEventKind::UploadComplete,
                QueueEventKind::QueueComplete,
            ]
        );

        let state = queue.get_state();
        assert_eq!(state.total_items, 1);
        assert_eq!(state.completed_items, 1);
        assert!(!state.is_processing);
        assert_eq!(*queue.subscribe_progress().borrow(), state_progress(&state));
    }

    fn state_progress(state: &QueueState) -> QueueProgress {
        QueueProgress {
            total: state.total_items,
            completed: state.completed_items,
            failed: state.failed_items,
            active: state.active_items,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_cap() {
        init_logger();
        let transport = Arc::new(MemoryTransport::with_throttle(2048, Duration::from_millis(20)));
        let queue = queue_with(QueueConfig::default(), transport.clone());
        let mut events = queue.subscribe();

        let ids = queue.add_multiple_photos((0..5).map(|_| photo("job-1")).collect());
        assert_eq!(ids.len(), 5);

        loop {
            let state = queue.get_state();
            let active = state.items.iter().filter(|i| i.status.is_active()).count();
            assert!(active <= 2, "{} items active", active);
            assert_eq!(active, state.active_items);
            if state.completed_items + state.failed_items == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        settle(&queue).await;

        assert!(transport.max_in_flight() <= 2);
        assert!(queue
            .get_items()
            .iter()
            .all(|i| i.status == ItemStatus::Completed));
        assert_eq!(queue.get_uploaded_photos().len(), 5);

        let events = drain(&mut events);
        let complete = events
            .iter()
            .filter(|e| e.kind == QueueEventKind::QueueComplete)
            .count();
        assert_eq!(complete, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_transport_backs_off_then_fails() {
        init_logger();
        let recording = Arc::new(RecordingTransport {
            inner: MemoryTransport::new(),
            started: Mutex::new(Vec::new()),
        });
        recording.inner.fail_always(true);
        let queue = UploadQueue::new(
            retries(4),
            Compressor::new(CompressionProfile::standard()),
            recording.clone(),
        )
        .unwrap();
        let mut events = queue.subscribe();

        let id = queue.add_photo(photo("job-1"));
        settle(&queue).await;

        let item = queue.get_item(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.retry_count, 4);
        assert!(item.uploaded_url.is_none());
        assert!(item.error.as_deref().unwrap().contains("simulated network failure"));

        let started = recording.started.lock().unwrap().clone();
        assert_eq!(started.len(), 4);
        for (gap, expected) in started.windows(2).zip([1000u64, 2000, 4000]) {
            let gap = gap[1] - gap[0];
            let expected = Duration::from_millis(expected);
            assert!(gap >= expected, "{:?} < {:?}", gap, expected);
            assert!(gap < expected + Duration::from_millis(250), "{:?}", gap);
        }

        let events = drain(&mut events);
        let count = |kind| events.iter().filter(|e| e.kind == kind).count();
        assert_eq!(count(QueueEventKind::UploadError), 4);
        assert_eq!(count(QueueEventKind::Retry), 3);
        assert_eq!(count(QueueEventKind::Failed), 1);
        // compressed once, reused by every retry
        assert_eq!(count(QueueEventKind::CompressionStart), 1);

        // no silent retries afterwards
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(recording.started.lock().unwrap().len(), 4);
        assert_eq!(queue.get_state().failed_items, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next(2);
        let queue = queue_with(retries(3), transport.clone());

        let id = queue.add_photo(photo("job-1"));
        settle(&queue).await;

        let item = queue.get_item(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.retry_count, 2);
        assert!(item.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_input_fails_without_retry() {
        let transport = Arc::new(MemoryTransport::new());
        let queue = queue_with(retries(3), transport.clone());
        let mut events = queue.subscribe();

        let id = queue.add_photo(PhotoInput::new(
            b"definitely not an image".to_vec(),
            "notes.txt",
            PhotoMetadata::new("job-1", PhotoCategory::Issue),
        ));
        settle(&queue).await;

        let item = queue.get_item(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.retry_count, 1);
        assert!(item.error.as_deref().unwrap().contains("decode"));
        assert!(item.holds_original());
        assert_eq!(transport.total_attempts(), 0);

        let events = drain(&mut events);
        assert!(events.iter().all(|e| e.kind != QueueEventKind::Retry));
        assert!(events.iter().any(|e| e.kind == QueueEventKind::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_progress_and_resume_continues() {
        init_logger();
        let transport = Arc::new(MemoryTransport::with_throttle(1024, Duration::from_millis(20)));
        let queue = queue_with(QueueConfig::default(), transport.clone());
        let mut events = queue.subscribe();

        let id = queue.add_photo(PhotoInput::new(
            test_jpeg(640, 480),
            "big.jpg",
            PhotoMetadata::new("job-1", PhotoCategory::Before),
        ));
        wait_for_upload(&queue, &id).await;

        queue.pause();
        assert!(queue.is_paused());
        // let the chunk in flight land
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frozen = queue.get_item(&id).unwrap().progress;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let item = queue.get_item(&id).unwrap();
        assert_eq!(item.progress, frozen);
        assert_eq!(item.status, ItemStatus::Uploading);
        assert!(frozen < 100);

        queue.resume();
        settle(&queue).await;
        let item = queue.get_item(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.progress, 100);
        assert_eq!(transport.total_attempts(), 2);

        let progress: Vec<u64> = drain(&mut events)
            .into_iter()
            .filter(|e| e.kind == QueueEventKind::UploadProgress)
            .filter_map(|e| e.data.and_then(|d| d["progress"].as_u64()))
            .collect();
        assert!(progress.windows(2).all(|w| w[0] < w[1]), "{:?}", progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_admission() {
        let transport = Arc::new(MemoryTransport::new());
        let queue = queue_with(QueueConfig::default(), transport.clone());
        queue.pause();

        let id = queue.add_photo(photo("job-1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(queue.get_item(&id).unwrap().status, ItemStatus::Pending);
        assert!(!queue.get_state().is_processing);

        queue.resume();
        settle(&queue).await;
        assert_eq!(queue.get_item(&id).unwrap().status, ItemStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_removes_item_and_silences_it() {
        let transport = Arc::new(MemoryTransport::with_throttle(1024, Duration::from_millis(20)));
        let queue = queue_with(QueueConfig::default(), transport.clone());

        let id = queue.add_photo(PhotoInput::new(
            test_jpeg(640, 480),
            "big.jpg",
            PhotoMetadata::new("job-1", PhotoCategory::Before),
        ));
        let other = queue.add_photo(photo("job-1"));
        wait_for_upload(&queue, &id).await;

        let mut events = queue.subscribe();
        queue.cancel_item(&id).unwrap();
        assert!(queue.get_item(&id).is_none());
        assert!(queue.get_items().iter().all(|i| i.id != id));
        assert_eq!(queue.get_state().total_items, 1);

        settle(&queue).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let events = drain(&mut events);
        assert!(events.iter().all(|e| e.item_id.as_deref() != Some(id.as_str())));
        assert_eq!(queue.get_item(&other).unwrap().status, ItemStatus::Completed);

        assert!(transport
            .object(&format!("job-1/before/{}_thumb.jpg", id))
            .is_none());
        assert!(matches!(
            queue.cancel_item(&id),
            Err(QueueError::ItemNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thumbnail_failure_keeps_item_incomplete() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_keys_containing("_thumb");
        let queue = queue_with(retries(2), transport.clone());
        let mut events = queue.subscribe();

        let id = queue.add_photo(photo("job-1"));
        settle(&queue).await;

        let item = queue.get_item(&id).unwrap();
        let (main_key, thumb_key) = item.destination_keys(OutputEncoding::Jpeg);
        assert_eq!(item.status, ItemStatus::Failed);
        assert!(item.uploaded_url.is_none());
        assert!(item.uploaded_thumbnail_url.is_none());
        assert!(transport.object(&main_key).is_some());
        assert_eq!(transport.attempts_for(&main_key), 2);
        assert_eq!(transport.attempts_for(&thumb_key), 2);
        assert!(queue.get_uploaded_photos().is_empty());

        transport.clear_failures();
        queue.retry_item(&id).unwrap();
        settle(&queue).await;

        let item = queue.get_item(&id).unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.retry_count, 0);
        assert_eq!(transport.object_count(), 2);

        let compressions = drain(&mut events)
            .iter()
            .filter(|e| e.kind == QueueEventKind::CompressionStart)
            .count();
        assert_eq!(compressions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_item_rejects_unfailed() {
        let transport = Arc::new(MemoryTransport::new());
        let queue = queue_with(QueueConfig::default(), transport);
        let id = queue.add_photo(photo("job-1"));
        settle(&queue).await;

        assert!(matches!(
            queue.retry_item(&id),
            Err(QueueError::InvalidState {
                status: ItemStatus::Completed,
                ..
            })
        ));
        assert!(matches!(
            queue.retry_item("missing"),
            Err(QueueError::ItemNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_all_failed() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_always(true);
        let queue = queue_with(retries(1), transport.clone());

        queue.add_multiple_photos(vec![photo("a"), photo("b")]);
        settle(&queue).await;
        assert_eq!(queue.get_state().failed_items, 2);

        transport.fail_always(false);
        let retried = queue.retry_all_failed();
        assert_eq!(retried.len(), 2);
        assert_eq!(queue.get_state().failed_items, 0);
        settle(&queue).await;

        let state = queue.get_state();
        assert_eq!(state.completed_items, 2);
        assert_eq!(state.failed_items, 0);
        assert!(queue.retry_all_failed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_clear_completed() {
        let transport = Arc::new(MemoryTransport::with_throttle(1024, Duration::from_millis(20)));
        let queue = queue_with(QueueConfig::default(), transport.clone());

        queue.add_multiple_photos((0..3).map(|_| photo("job-1")).collect());
        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.pause();
        queue.clear();

        let state = queue.get_state();
        assert_eq!(state.total_items, 0);
        assert_eq!(state.active_items, 0);
        assert!(!state.is_processing);
        assert!(!state.is_paused);
        assert_eq!(*queue.subscribe_progress().borrow(), QueueProgress::default());

        // the queue is usable again afterwards
        let id = queue.add_photo(photo("job-2"));
        let failing = queue.add_photo(PhotoInput::new(
            vec![0; 16],
            "broken.jpg",
            PhotoMetadata::new("job-2", PhotoCategory::Other),
        ));
        settle(&queue).await;
        assert_eq!(queue.get_item(&id).unwrap().status, ItemStatus::Completed);

        assert_eq!(queue.clear_completed(), 1);
        let items = queue.get_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, failing);
        assert_eq!(queue.get_state().completed_items, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploaded_photos_carry_metadata() {
        let transport = Arc::new(MemoryTransport::new());
        let queue = queue_with(QueueConfig::default(), transport);

        let id = queue.add_photo(PhotoInput::new(
            test_jpeg(200, 100),
            "leak.jpg",
            PhotoMetadata::new("job-9", PhotoCategory::Issue)
                .with_caption("Leak under sink")
                .with_room("Bathroom")
                .with_issue(Some("issue-3".to_string())),
        ));
        settle(&queue).await;

        let photos = queue.get_uploaded_photos();
        assert_eq!(photos.len(), 1);
        let photo = &photos[0];
        assert_eq!(photo.id, id);
        assert_eq!(photo.job_id, "job-9");
        assert_eq!(photo.category, PhotoCategory::Issue);
        assert_eq!(photo.caption.as_deref(), Some("Leak under sink"));
        assert_eq!(photo.room_label.as_deref(), Some("Bathroom"));
        assert!(photo.is_issue_photo);
        assert_eq!(photo.issue_id.as_deref(), Some("issue-3"));
        assert!(photo.thumbnail_url.ends_with("_thumb.jpg"));
    }

    #[tokio::test]
    async fn test_compress_async() {
        let compressor = Compressor::new(CompressionProfile::reduced());
        let out = compress_async(compressor, Arc::new(test_jpeg(1600, 1200)))
            .await
            .unwrap();
        assert_eq!((out.width, out.height), (1280, 960));

        let err = compress_async(
            Compressor::new(CompressionProfile::reduced()),
            Arc::new(vec![1, 2, 3]),
        )
        .await
        .unwrap_err();
        assert!(err.is_permanent());
    }
}
