//! WebDAV storage backend (Nextcloud)
//!
//! Collections are created with best-effort MKCOL through `reqwest_dav`, the
//! object itself is sent as a streaming PUT so transfers can be paused
//! between chunks without dropping what was already sent.

use super::transport::{ProgressFn, ProgressReporter, TransferControl, TransferPayload, UploadTransport};
use crate::config::WebDavConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Url;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Prefix for object metadata sent as request headers
const METADATA_HEADER_PREFIX: &str = "x-capture-";

pub struct WebDavTransport {
    config: WebDavConfig,
    http: reqwest::Client,
    dav: reqwest_dav::Client,
    /// Collections already created (or found to exist) during this session
    known_collections: Mutex<HashSet<String>>,
}

impl WebDavTransport {
    pub fn new(config: WebDavConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::Other(format!("HTTP client error: {}", e)))?;
        Self::with_http_client(config, http)
    }

    /// Uses `http` for both MKCOL and PUT requests (proxy, timeouts, TLS roots)
    pub fn with_http_client(
        config: WebDavConfig,
        http: reqwest::Client,
    ) -> Result<Self, TransportError> {
        config
            .validate()
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let dav = reqwest_dav::ClientBuilder::new()
            .set_agent(http.clone())
            .set_host(config.webdav_url())
            .set_auth(reqwest_dav::Auth::Basic(
                config.username.clone(),
                config.app_password.clone(),
            ))
            .build()
            .map_err(|e| TransportError::Other(format!("WebDAV client error: {:?}", e)))?;

        Ok(Self {
            config,
            http,
            dav,
            known_collections: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &WebDavConfig {
        &self.config
    }

    /// Path of `destination_key` relative to the DAV endpoint
    pub fn remote_path(&self, destination_key: &str) -> String {
        remote_segments(&self.config.remote_path, destination_key).join("/")
    }

    /// Absolute URL the object is stored at
    pub fn object_url(&self, destination_key: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.config.webdav_url())
            .map_err(|e| TransportError::Other(format!("Invalid server URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| TransportError::Other("Server URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(remote_segments(&self.config.remote_path, destination_key));
        Ok(url)
    }

    /// Creates every parent collection of `destination_key`, ignoring failures
    ///
    /// Only collections that were created or answered 405 (already exists)
    /// are remembered. Anything else is logged and retried on the next send;
    /// a real problem surfaces as a failed PUT.
    async fn ensure_collections(&self, destination_key: &str) {
        let segments = remote_segments(&self.config.remote_path, destination_key);
        let parents = segments.len().saturating_sub(1);

        for depth in 1..=parents {
            let collection = segments[..depth].join("/");
            if self.collections().contains(&collection) {
                continue;
            }
            match self.dav.mkcol_raw(&collection).await {
                Ok(response)
                    if response.status().is_success() || response.status().as_u16() == 405 =>
                {
                    self.collections().insert(collection);
                }
                Ok(response) => {
                    log::debug!("MKCOL {} answered {}", collection, response.status());
                    return;
                }
                Err(e) => {
                    log::debug!("MKCOL {} failed: {:?}", collection, e);
                    return;
                }
            }
        }
    }

    fn collections(&self) -> MutexGuard<'_, HashSet<String>> {
        self.known_collections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    async fn put(
        &self,
        url: Url,
        payload: TransferPayload,
        control: TransferControl,
        on_progress: ProgressFn,
    ) -> Result<(), TransportError> {
        let total = payload.bytes.len();
        let mut reporter = ProgressReporter::new(total, on_progress);
        reporter.report(0);

        let body = chunked_body(payload.bytes, self.config.chunk_size, control, reporter);

        let mut request = self
            .http
            .put(url)
            .basic_auth(&self.config.username, Some(&self.config.app_password))
            .header(CONTENT_TYPE, payload.content_type)
            .header(CONTENT_LENGTH, total);
        for (name, value) in metadata_headers(&payload.metadata) {
            request = request.header(name, value);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect::<String>();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: if message.is_empty() {
                    status.to_string()
                } else {
                    message
                },
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for WebDavTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebDavTransport")
            .field("server_url", &self.config.server_url)
            .field("username", &self.config.username)
            .field("remote_path", &self.config.remote_path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl UploadTransport for WebDavTransport {
    async fn send(
        &self,
        payload: TransferPayload,
        control: TransferControl,
        on_progress: ProgressFn,
    ) -> Result<String, TransportError> {
        control.checkpoint().await?;
        let url = self.object_url(&payload.destination_key)?;
        let size = payload.bytes.len();
        let key = payload.destination_key.clone();

        let cancel = control.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = async {
                self.ensure_collections(&key).await;
                self.put(url.clone(), payload, control, on_progress).await
            } => result?,
        }

        log::info!("Uploaded {} ({} bytes)", key, size);
        Ok(url.to_string())
    }
}

/// Request body that hands out `chunk_size` slices, checking the control
/// handle before each one
fn chunked_body(
    bytes: Arc<Vec<u8>>,
    chunk_size: usize,
    control: TransferControl,
    reporter: ProgressReporter,
) -> reqwest::Body {
    let chunk_size = chunk_size.max(1);
    let stream = futures::stream::try_unfold(
        (bytes, 0usize, control, reporter),
        move |(bytes, offset, control, mut reporter)| async move {
            if offset >= bytes.len() {
                return Ok(None);
            }
            control.checkpoint().await?;
            let end = (offset + chunk_size).min(bytes.len());
            let chunk = bytes[offset..end].to_vec();
            reporter.report(end);
            Ok::<_, TransportError>(Some((chunk, (bytes, end, control, reporter))))
        },
    );
    reqwest::Body::wrap_stream(stream)
}

/// Path segments below the DAV endpoint, empty ones dropped
fn remote_segments(remote_path: &str, destination_key: &str) -> Vec<String> {
    remote_path
        .split('/')
        .chain(destination_key.split('/'))
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(str::to_string)
        .collect()
}

/// Metadata as `x-capture-*` headers; entries that are not valid header text are skipped
fn metadata_headers(metadata: &BTreeMap<String, String>) -> Vec<(HeaderName, HeaderValue)> {
    metadata
        .iter()
        .filter_map(|(key, value)| {
            let name = format!("{}{}", METADATA_HEADER_PREFIX, key.replace('_', "-"));
            let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()).ok()?;
            let value = HeaderValue::from_str(value).ok()?;
            Some((name, value))
        })
        .collect()
}
