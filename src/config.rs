//! Pipeline configuration, loadable from TOML
//!
//! ```toml
//! [queue]
//! max_concurrent_uploads = 2
//! max_retries = 3
//!
//! [webdav]
//! server_url = "https://cloud.example.com"
//! username = "operator"
//! app_password = "xxxxx-xxxxx"
//! remote_path = "/FieldPhotos"
//!
//! [profile]
//! mode = "auto"
//! ```

use crate::error::QueueError;
use photo_compress::{select_profile, CompressionProfile};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Scheduling and retry parameters of the upload queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Kept small so mobile uplinks and CPUs are not saturated
    pub max_concurrent_uploads: usize,
    pub max_retries: u32,
    /// Delay before the first retry; doubles with every further failure
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Pause between scheduling passes
    pub tick_interval_ms: u64,
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 2,
            max_retries: 3,
            base_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            tick_interval_ms: 100,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_concurrent_uploads == 0 {
            return Err(QueueError::Config(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(QueueError::Config("max_retries must be at least 1".to_string()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(QueueError::Config(format!(
                "max_backoff_ms ({}) must not be below base_backoff_ms ({})",
                self.max_backoff_ms, self.base_backoff_ms
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(QueueError::Config("tick_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Delay after the `failed_attempts`-th failure: base, 2x base, 4x base ...
    /// capped at `max_backoff_ms`
    pub fn backoff_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let delay = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_chunk_size() -> usize {
    64 * 1024
}

/// Connection settings for a Nextcloud/WebDAV storage backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebDavConfig {
    pub server_url: String,
    pub username: String,
    pub app_password: String,
    /// Collection all objects are stored under
    pub remote_path: String,
    /// Bytes sent between pause/cancel checkpoints
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl WebDavConfig {
    pub fn new(
        server_url: String,
        username: String,
        app_password: String,
        remote_path: String,
    ) -> Self {
        Self {
            server_url,
            username,
            app_password,
            remote_path,
            chunk_size: default_chunk_size(),
        }
    }

    /// DAV endpoint for the user's files
    pub fn webdav_url(&self) -> String {
        format!(
            "{}/remote.php/dav/files/{}",
            self.server_url.trim_end_matches('/'),
            self.username
        )
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if !(self.server_url.starts_with("https://") || self.server_url.starts_with("http://")) {
            return Err(QueueError::Config(format!(
                "server_url must be an http(s) URL, got '{}'",
                self.server_url
            )));
        }
        if self.username.trim().is_empty() {
            return Err(QueueError::Config("username must not be empty".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(QueueError::Config("chunk_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// How the compression profile for the session is chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ProfileSelection {
    /// Ask the capability detector
    #[default]
    Auto,
    Standard,
    Reduced,
    Custom(CompressionProfile),
}

impl ProfileSelection {
    pub fn resolve(&self) -> CompressionProfile {
        match self {
            ProfileSelection::Auto => select_profile(),
            ProfileSelection::Standard => CompressionProfile::standard(),
            ProfileSelection::Reduced => CompressionProfile::reduced(),
            ProfileSelection::Custom(profile) => profile.clone(),
        }
    }
}

/// Complete configuration of the capture pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub webdav: Option<WebDavConfig>,
    pub profile: ProfileSelection,
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, QueueError> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| QueueError::Config(format!("TOML parse failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        log::debug!("Loading pipeline config from {:?}", path);
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        self.queue.validate()?;
        if let Some(webdav) = &self.webdav {
            webdav.validate()?;
        }
        if let ProfileSelection::Custom(profile) = &self.profile {
            profile.validate().map_err(QueueError::Config)?;
        }
        Ok(())
    }
}
