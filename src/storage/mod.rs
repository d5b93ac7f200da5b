//! Object storage abstraction.
//!
//! Provides a single interface over S3 (and S3-compatible stores), the local
//! filesystem and an in-memory store, with request metrics on every call.

mod local;
mod s3;
mod sink;

pub use local::LocalConfig;
pub use s3::S3Config;
pub use sink::ObjectSink;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryFutureExt, TryStreamExt, future::ready};
use object_store::memory::InMemory;
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{MultipartId, ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{MB, ReconcilerConfig};
use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    ActiveMultipartParts, RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Thresholds for switching from a single PUT to a parallel multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartOptions {
    pub part_size: usize,
    pub min_multipart_size: usize,
    pub max_concurrent_parts: usize,
}

impl Default for MultipartOptions {
    fn default() -> Self {
        Self::from(&ReconcilerConfig::default())
    }
}

impl From<&ReconcilerConfig> for MultipartOptions {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            part_size: config.part_size_mb * MB,
            min_multipart_size: config.min_multipart_size_mb * MB,
            max_concurrent_parts: config.max_concurrent_parts.max(1),
        }
    }
}

/// Storage provider that abstracts over the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    /// Present for backends with explicit part numbering (S3, in-memory).
    pub(crate) multipart_store: Option<Arc<dyn MultipartStore>>,
    pub(crate) canonical_url: String,
    pub(crate) multipart: MultipartOptions,
    /// Upper bound on a single request; `None` waits indefinitely.
    pub(crate) request_timeout: Option<Duration>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

static S3_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [S3_PATH, S3_VIRTUAL, S3_ENDPOINT_URL, S3_URL]
        .into_iter()
        .map(|p| Regex::new(p).expect("S3 URL pattern is valid"))
        .collect()
});

static LOCAL_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [FILE_URI, FILE_URL, FILE_PATH]
        .into_iter()
        .map(|p| Regex::new(p).expect("file URL pattern is valid"))
        .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
    Memory { name: String },
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        if let Some(caps) = S3_MATCHERS.iter().find_map(|r| r.captures(url)) {
            return Ok(Self::parse_s3(&caps));
        }
        if let Some(caps) = LOCAL_MATCHERS.iter().find_map(|r| r.captures(url)) {
            return Ok(Self::parse_local(&caps));
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: &regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        let key = matches.name("key").map(|m| m.as_str().into());

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        })
    }

    fn parse_local(matches: &regex::Captures) -> Self {
        let path = matches.name("path").map(|m| m.as_str()).unwrap_or_default();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        BackendConfig::Local(LocalConfig {
            path: path.into(),
            key: None,
        })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(local) => local.key.as_ref(),
            BackendConfig::Memory { .. } => None,
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory { name } => Ok(Self::in_memory(name)),
        }
    }

    /// A store that keeps objects in process memory.
    pub fn in_memory(name: impl Into<String>) -> Self {
        let store = Arc::new(InMemory::new());
        let multipart_store: Option<Arc<dyn MultipartStore>> = Some(store.clone());
        Self::from_stores(name, store, multipart_store)
    }

    /// A named provider over stores built elsewhere.
    pub(crate) fn from_stores(
        name: impl Into<String>,
        object_store: Arc<dyn ObjectStore>,
        multipart_store: Option<Arc<dyn MultipartStore>>,
    ) -> Self {
        let name = name.into();
        Self {
            canonical_url: format!("memory://{name}"),
            config: BackendConfig::Memory { name },
            object_store,
            multipart_store,
            multipart: MultipartOptions::default(),
            request_timeout: None,
        }
    }

    /// Override the multipart thresholds used by [`ObjectSink::put_object`].
    pub fn with_multipart(mut self, multipart: MultipartOptions) -> Self {
        self.multipart = multipart;
        self
    }

    /// Bound every request (each part of a multipart upload included).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Bucket (or root) this provider writes into.
    pub fn bucket(&self) -> &str {
        match &self.config {
            BackendConfig::S3(s3) => &s3.bucket,
            BackendConfig::Local(local) => local.path.to_str().unwrap_or_default(),
            BackendConfig::Memory { name } => name,
        }
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Run a single store request under the request timeout and record it.
    async fn request<T>(
        &self,
        operation: StorageOperation,
        request: impl Future<Output = object_store::Result<T>>,
    ) -> Result<T, StorageError> {
        let start = Instant::now();
        let result = bounded(self.request_timeout, request).await;

        emit!(StorageRequest {
            operation,
            status: RequestStatus::from_result(&result),
        });
        emit!(StorageRequestDuration {
            operation,
            duration: start.elapsed(),
        });

        result
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let path = self.qualify_path(&path);
        self.request(
            StorageOperation::Get,
            self.object_store.get(&path).and_then(|result| result.bytes()),
        )
        .await
    }

    /// Put a payload to a path.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        self.request(StorageOperation::Put, self.object_store.put(&path, payload))
            .await?;
        Ok(())
    }

    /// Server-side rename (copy + delete on S3, `rename(2)` locally).
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let from = self.qualify_path(from);
        let to = self.qualify_path(to);
        self.request(StorageOperation::Rename, self.object_store.rename(&from, &to))
            .await
    }

    /// Write content to `{path}.tmp` and rename it over `path`.
    ///
    /// If the write or rename fails, the previous object (if any) is unchanged.
    pub async fn atomic_write(&self, path: &Path, content: Vec<u8>) -> Result<(), StorageError> {
        let temp_path = Path::from(format!("{path}.tmp"));
        self.put_payload(&temp_path, PutPayload::from(Bytes::from(content)))
            .await?;
        self.rename(&temp_path, path).await
    }

    /// List object paths below `prefix`, relative to the configured key prefix.
    pub fn list_with_prefix(
        &self,
        prefix: Option<&str>,
    ) -> impl Stream<Item = Result<Path, StorageError>> + '_ {
        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: RequestStatus::Success,
        });

        let full_prefix: Option<Path> = match (self.config.key(), prefix) {
            (Some(key), Some(prefix)) => {
                Some(key.parts().chain(Path::from(prefix).parts()).collect())
            }
            (Some(key), None) => Some(key.clone()),
            (None, Some(prefix)) => Some(Path::from(prefix)),
            (None, None) => None,
        };
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        self.object_store
            .list(full_prefix.as_ref())
            .then(move |meta| {
                ready(match meta {
                    Ok(meta) => Ok(meta
                        .location
                        .parts()
                        .skip(key_part_count)
                        .collect::<Path>()),
                    Err(source) => Err(StorageError::ObjectStore { source }),
                })
            })
    }

    /// Collect and sort all object paths below `prefix`.
    pub async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .list_with_prefix(prefix)
            .map_ok(|path| path.to_string())
            .try_collect()
            .await?;
        keys.sort();
        Ok(keys)
    }

    /// Upload bytes, using a parallel multipart upload for large payloads.
    ///
    /// Small payloads, and backends without `MultipartStore`, use a single PUT.
    /// Parts may complete out of order; they are committed by index. The
    /// request timeout applies to each request, not to the whole upload. An
    /// upload that fails, or whose future is dropped, is aborted.
    pub async fn put_multipart_bytes(
        &self,
        path: &Path,
        bytes: Bytes,
        options: MultipartOptions,
    ) -> Result<(), StorageError> {
        let multipart_store = match &self.multipart_store {
            Some(store) if bytes.len() >= options.min_multipart_size => store.clone(),
            _ => return self.put_payload(path, PutPayload::from(bytes)).await,
        };
        let qualified_path = self.qualify_path(path).into_owned();

        let multipart_id = self
            .request(
                StorageOperation::CreateMultipart,
                multipart_store.create_multipart(&qualified_path),
            )
            .await?;
        let upload = AbortOnDrop {
            store: multipart_store.clone(),
            path: qualified_path.clone(),
            id: multipart_id.clone(),
            timeout: self.request_timeout,
            armed: true,
        };

        let part_size = options.part_size.max(1);
        let parts: Vec<(usize, Bytes)> = (0..)
            .zip((0..bytes.len()).step_by(part_size))
            .map(|(i, offset)| {
                let end = std::cmp::min(offset + part_size, bytes.len());
                (i, bytes.slice(offset..end))
            })
            .collect();

        let total_parts = parts.len();
        debug!(
            path = %path,
            bytes = bytes.len(),
            parts = total_parts,
            concurrency = options.max_concurrent_parts,
            "Starting multipart upload"
        );

        let active_parts = Arc::new(AtomicUsize::new(0));
        let uploaded = futures::stream::iter(parts)
            .map(|(idx, data)| {
                let multipart_store = &multipart_store;
                let qualified_path = &qualified_path;
                let multipart_id = &multipart_id;
                let active_parts = active_parts.clone();
                async move {
                    let count = active_parts.fetch_add(1, Ordering::Relaxed) + 1;
                    emit!(ActiveMultipartParts { count });

                    let result = self
                        .request(
                            StorageOperation::PutPart,
                            multipart_store.put_part(qualified_path, multipart_id, idx, data.into()),
                        )
                        .await;

                    let count = active_parts.fetch_sub(1, Ordering::Relaxed) - 1;
                    emit!(ActiveMultipartParts { count });

                    Ok::<_, StorageError>((idx, result?))
                }
            })
            .buffer_unordered(options.max_concurrent_parts.max(1))
            .try_collect::<Vec<(usize, PartId)>>()
            .await;

        let mut results = match uploaded {
            Ok(results) => results,
            Err(e) => {
                upload.abort().await;
                return Err(e);
            }
        };
        results.sort_by_key(|(idx, _)| *idx);
        let part_ids: Vec<PartId> = results.into_iter().map(|(_, id)| id).collect();

        let completed = self
            .request(
                StorageOperation::CompleteMultipart,
                multipart_store.complete_multipart(&qualified_path, &multipart_id, part_ids),
            )
            .await;
        if let Err(e) = completed {
            upload.abort().await;
            return Err(e);
        }

        upload.disarm();
        debug!(path = %path, parts = total_parts, "Completed multipart upload");
        Ok(())
    }
}

/// Await `request`, failing with [`StorageError::Timeout`] past `timeout`.
async fn bounded<T>(
    timeout: Option<Duration>,
    request: impl Future<Output = object_store::Result<T>>,
) -> Result<T, StorageError> {
    let Some(timeout) = timeout else {
        return request.await.context(ObjectStoreSnafu);
    };
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result.context(ObjectStoreSnafu),
        Err(_) => Err(StorageError::Timeout {
            secs: timeout.as_secs(),
        }),
    }
}

/// An open multipart upload. Dropping it while armed aborts the upload in
/// the background, so a cancelled `put_multipart_bytes` leaves no parts behind.
struct AbortOnDrop {
    store: Arc<dyn MultipartStore>,
    path: Path,
    id: MultipartId,
    timeout: Option<Duration>,
    armed: bool,
}

impl AbortOnDrop {
    async fn abort(mut self) {
        self.armed = false;
        abort_multipart(self.store.clone(), self.path.clone(), self.id.clone(), self.timeout).await;
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(path = %self.path, "Multipart upload dropped outside a runtime, parts not aborted");
            return;
        };
        handle.spawn(abort_multipart(
            self.store.clone(),
            self.path.clone(),
            self.id.clone(),
            self.timeout,
        ));
    }
}

async fn abort_multipart(
    store: Arc<dyn MultipartStore>,
    path: Path,
    id: MultipartId,
    timeout: Option<Duration>,
) {
    let start = Instant::now();
    let result = bounded(timeout, store.abort_multipart(&path, &id)).await;

    emit!(StorageRequest {
        operation: StorageOperation::AbortMultipart,
        status: RequestStatus::from_result(&result),
    });
    emit!(StorageRequestDuration {
        operation: StorageOperation::AbortMultipart,
        duration: start.elapsed(),
    });

    match result {
        Ok(()) => debug!(path = %path, "Aborted multipart upload"),
        Err(e) => warn!(path = %path, error = %e, "Failed to abort multipart upload"),
    }
}
