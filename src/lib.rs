//! # Capture Queue
//!
//! Resilient capture-to-storage pipeline for photos taken in the field.
//!
//! Captured images are accepted immediately and handed to an [`UploadQueue`],
//! which compresses them with [`photo_compress`] and sends main image and
//! thumbnail to remote storage. The queue:
//! - runs at most `max_concurrent_uploads` items at once
//! - retries failed attempts with capped exponential backoff
//! - supports pause/resume without losing transfer progress
//! - reports every transition as a [`QueueEvent`]
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use capture_queue::{PhotoCategory, PhotoInput, PhotoMetadata, PipelineConfig, UploadQueue};
//!
//! let config = PipelineConfig::load("capture.toml")?;
//! let queue = UploadQueue::from_config(&config)?;
//! queue.add_photo(PhotoInput::new(
//!     bytes,
//!     "IMG_0042.jpg",
//!     PhotoMetadata::new("job-17", PhotoCategory::After),
//! ));
//! queue.wait_until_idle().await;
//! for photo in queue.get_uploaded_photos() {
//!     println!("{} -> {}", photo.id, photo.url);
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod services;
pub mod store;

pub use config::{PipelineConfig, ProfileSelection, QueueConfig, WebDavConfig};
pub use error::{PipelineError, QueueError, TransportError};
pub use events::{EventBus, QueueEvent, QueueEventKind};
pub use models::{
    CompressedArtifacts, ItemStatus, PhotoCategory, PhotoInput, PhotoMetadata, QueueItem,
    QueueProgress, QueueState, UploadedPhoto,
};
pub use services::{
    MemoryTransport, TransferControl, TransferPayload, UploadQueue, UploadTransport,
    WebDavTransport,
};
pub use store::QueueStore;

pub use photo_compress;
