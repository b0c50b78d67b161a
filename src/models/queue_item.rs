use super::photo_metadata::{PhotoCategory, PhotoInput, PhotoMetadata};
use chrono::{DateTime, Utc};
use photo_compress::{CompressedImage, OutputEncoding};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

/// Lifecycle state of a queued photo
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Compressing,
    Uploading,
    /// Attempt failed, waiting for backoff before the next one
    Error,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Compressing => "compressing",
            ItemStatus::Uploading => "uploading",
            ItemStatus::Error => "error",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    /// Occupies a concurrency slot
    pub fn is_active(&self) -> bool {
        matches!(self, ItemStatus::Compressing | ItemStatus::Uploading)
    }

    /// No further automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// Encoded outputs of the compressor, shared between attempts without copying
#[derive(Debug, Clone)]
pub struct CompressedArtifacts {
    pub main: Arc<Vec<u8>>,
    pub thumbnail: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub quality_used: f32,
    pub encoding: OutputEncoding,
}

impl From<CompressedImage> for CompressedArtifacts {
    fn from(image: CompressedImage) -> Self {
        Self {
            main: Arc::new(image.main),
            thumbnail: Arc::new(image.thumbnail),
            width: image.width,
            height: image.height,
            quality_used: image.quality_used,
            encoding: image.encoding,
        }
    }
}

/// One photograph's record from admission to completion or failure
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    #[serde(flatten)]
    pub metadata: PhotoMetadata,
    pub original_name: String,
    pub original_size: usize,
    /// Released once compression succeeded
    #[serde(skip)]
    pub(crate) original: Option<Arc<Vec<u8>>>,
    #[serde(skip)]
    pub(crate) artifacts: Option<CompressedArtifacts>,
    pub compressed_size: Option<usize>,
    pub thumbnail_data_uri: Option<String>,
    pub status: ItemStatus,
    /// 0..=100, restarts at 0 with every attempt
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub uploaded_url: Option<String>,
    pub uploaded_thumbnail_url: Option<String>,
    /// Earliest moment an item in `Error` may be attempted again
    #[serde(skip)]
    pub(crate) next_attempt_at: Option<Instant>,
}

impl QueueItem {
    pub fn new(input: PhotoInput, max_retries: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metadata: input.metadata,
            original_name: input.original_name,
            original_size: input.bytes.len(),
            original: Some(Arc::new(input.bytes)),
            artifacts: None,
            compressed_size: None,
            thumbnail_data_uri: None,
            status: ItemStatus::Pending,
            progress: 0,
            retry_count: 0,
            max_retries,
            error: None,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
            uploaded_url: None,
            uploaded_thumbnail_url: None,
            next_attempt_at: None,
        }
    }

    pub fn category(&self) -> PhotoCategory {
        self.metadata.category
    }

    /// Compressed outputs, once produced
    pub fn artifacts(&self) -> Option<&CompressedArtifacts> {
        self.artifacts.as_ref()
    }

    /// Whether the raw capture is still held in memory
    pub fn holds_original(&self) -> bool {
        self.original.is_some()
    }

    /// Stores the compressor output; artifacts are set at most once
    pub(crate) fn set_artifacts(&mut self, image: CompressedImage) -> bool {
        if self.artifacts.is_some() {
            return false;
        }
        self.compressed_size = Some(image.main_size);
        self.thumbnail_data_uri = Some(image.thumbnail_data_uri());
        self.artifacts = Some(CompressedArtifacts::from(image));
        self.original = None;
        true
    }

    /// Storage keys for the main image and the thumbnail
    pub fn destination_keys(&self, encoding: OutputEncoding) -> (String, String) {
        let job = sanitize_key_segment(&self.metadata.job_id);
        let job = if job.is_empty() { "unassigned".to_string() } else { job };
        let base = format!("{}/{}/{}", job, self.metadata.category.as_str(), self.id);
        (
            format!("{}.{}", base, encoding.extension()),
            format!("{}_thumb.{}", base, encoding.extension()),
        )
    }
}

/// Keeps caller-provided ids from escaping their directory
fn sanitize_key_segment(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

/// A completed upload, in the shape the caller attaches to its job record
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UploadedPhoto {
    pub id: String,
    pub job_id: String,
    pub url: String,
    pub thumbnail_url: String,
    pub category: PhotoCategory,
    pub caption: Option<String>,
    pub room_label: Option<String>,
    pub is_issue_photo: bool,
    pub issue_id: Option<String>,
}

impl UploadedPhoto {
    /// Only completed items produce an uploaded photo
    pub fn from_item(item: &QueueItem) -> Option<Self> {
        if item.status != ItemStatus::Completed {
            return None;
        }
        Some(Self {
            id: item.id.clone(),
            job_id: item.metadata.job_id.clone(),
            url: item.uploaded_url.clone()?,
            thumbnail_url: item.uploaded_thumbnail_url.clone()?,
            category: item.metadata.category,
            caption: item.metadata.caption.clone(),
            room_label: item.metadata.room_label.clone(),
            is_issue_photo: item.metadata.is_issue_photo,
            issue_id: item.metadata.issue_id.clone(),
        })
    }
}
