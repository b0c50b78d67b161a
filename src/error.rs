use crate::models::ItemStatus;
use photo_compress::CompressionError;

/// Errors produced by an upload transport
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// Connection failed or dropped mid-transfer
    #[error("Network error: {0}")]
    Network(String),
    /// Server answered with a non-success status
    #[error("Server rejected upload ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// Transfer aborted through its control handle
    #[error("Transfer cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }

    /// User-friendly error message for UI
    pub fn user_message(&self) -> String {
        match self {
            TransportError::Network(_) => {
                "Upload failed. Please check the network connection.".to_string()
            }
            TransportError::Rejected { status, .. } => {
                format!("The server refused the upload (HTTP {}).", status)
            }
            TransportError::Cancelled => "Upload cancelled.".to_string(),
            TransportError::Other(msg) => msg.clone(),
        }
    }
}

/// Failure of a single compress-then-upload attempt
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The item disappeared from the queue while the attempt ran
    #[error("Item was removed from the queue")]
    Removed,
}

impl PipelineError {
    /// Retrying cannot help (input is not an image)
    pub fn is_permanent(&self) -> bool {
        matches!(self, PipelineError::Compression(e) if e.is_permanent())
    }

    /// Explicit user action, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Transport(TransportError::Cancelled) | PipelineError::Removed
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Compression(e) => e.user_message(),
            PipelineError::Transport(e) => e.user_message(),
            PipelineError::Removed => "Upload cancelled.".to_string(),
        }
    }
}

/// Errors returned by queue operations and configuration loading
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue item not found: {0}")]
    ItemNotFound(String),
    #[error("Queue item {id} is {status:?}, operation not allowed")]
    InvalidState { id: String, status: ItemStatus },
    #[error("Configuration error: {0}")]
    Config(String),
    /// Queue was created outside of a tokio runtime
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl QueueError {
    pub fn user_message(&self) -> String {
        match self {
            QueueError::ItemNotFound(_) => "The photo is no longer in the upload queue.".to_string(),
            QueueError::InvalidState { .. } => {
                "This action is not possible for the photo right now.".to_string()
            }
            QueueError::Config(msg) => format!("Invalid upload settings: {}", msg),
            QueueError::Runtime(_) | QueueError::Io(_) => {
                "The upload queue could not be started.".to_string()
            }
            QueueError::Transport(e) => e.user_message(),
        }
    }
}
