//! Upload target used by the reconciler.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;

use crate::error::StorageError;

use super::StorageProvider;

/// Destination for finalized part files.
///
/// Implementations must make the object visible under `key` only once the
/// whole body is stored, so a failed attempt can be repeated safely. They
/// are expected to bound each request they make and fail with
/// [`StorageError::Timeout`] rather than hang.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    /// Bucket name reported in upload acknowledgements.
    fn bucket(&self) -> &str;

    /// Store `data` under `key`, replacing any previous object.
    async fn put_object(&self, key: &str, data: Bytes) -> Result<(), StorageError>;
}

#[async_trait]
impl ObjectSink for StorageProvider {
    fn bucket(&self) -> &str {
        StorageProvider::bucket(self)
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.put_multipart_bytes(&Path::from(key), data, self.multipart)
            .await
    }
}
