//! Local filesystem storage backend implementation.

use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{IoSnafu, ObjectStoreSnafu, StorageError};

use super::{BackendConfig, MultipartOptions, StorageProvider};

/// Local filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: PathBuf,
    pub key: Option<Path>,
}

impl StorageProvider {
    /// Create a provider rooted at a local directory, creating it if needed.
    pub async fn local(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::construct_local(LocalConfig {
            path: path.into(),
            key: None,
        })
        .await
    }

    pub(super) async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .context(IoSnafu)?;

        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(&config.path).context(ObjectStoreSnafu)?);

        let canonical_url = format!("file://{}", config.path.display());

        Ok(Self {
            config: BackendConfig::Local(config),
            object_store,
            // Local filesystem does not support MultipartStore
            multipart_store: None,
            canonical_url,
            multipart: MultipartOptions::default(),
            request_timeout: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let storage = StorageProvider::local(dir.path().join("root")).await.unwrap();

        let path = Path::from("_flurry/checkpoint.json");
        storage.atomic_write(&path, b"{}".to_vec()).await.unwrap();

        let on_disk = dir.path().join("root/_flurry/checkpoint.json");
        assert_eq!(std::fs::read(on_disk).unwrap(), b"{}");
        assert!(!dir.path().join("root/_flurry/checkpoint.json.tmp").exists());
    }
}
