pub mod photo_metadata;
pub mod queue_item;
pub mod queue_state;

pub use photo_metadata::{PhotoCategory, PhotoInput, PhotoMetadata};
pub use queue_item::{CompressedArtifacts, ItemStatus, QueueItem, UploadedPhoto};
pub use queue_state::{QueueProgress, QueueState};
