//! Dead letter queue for uploads that reached the failed state.
//!
//! Failed uploads are buffered and written as NDJSON to a configured storage
//! location. Each flush writes a new object, so earlier batches are never
//! overwritten.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::PutPayload;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::ErrorHandlingConfig;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::reconciler::UploadRecord;
use crate::storage::StorageProvider;

const BUFFER_SIZE: usize = 100;

/// Where in the upload an unrecoverable error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    /// Reading the finalized file from the staging directory.
    Read,
    /// Writing the object to the destination bucket.
    Upload,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Read => "read",
            FailureStage::Upload => "upload",
        }
    }
}

/// One line of the dead letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUpload {
    pub local_path: PathBuf,
    pub key: String,
    pub error: String,
    pub stage: FailureStage,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailureStats {
    pub read: usize,
    pub upload: usize,
}

impl FailureStats {
    pub fn increment(&mut self, stage: FailureStage) {
        match stage {
            FailureStage::Read => self.read += 1,
            FailureStage::Upload => self.upload += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.read + self.upload
    }
}

pub struct DeadLetterQueue {
    storage: Arc<StorageProvider>,
    /// Common prefix of this run's DLQ objects.
    run_prefix: String,
    flushes: usize,
    buffer: Vec<FailedUpload>,
    stats: FailureStats,
}

impl DeadLetterQueue {
    /// Create a DLQ from configuration.
    ///
    /// Returns `None` if no DLQ path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        let run_prefix = format!("failures-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        info!(path = %dlq_path, prefix = %run_prefix, "DLQ enabled");

        Ok(Some(Self::new(Arc::new(storage), run_prefix)))
    }

    pub fn new(storage: Arc<StorageProvider>, run_prefix: impl Into<String>) -> Self {
        Self {
            storage,
            run_prefix: run_prefix.into(),
            flushes: 0,
            buffer: Vec::new(),
            stats: FailureStats::default(),
        }
    }

    /// Record an upload that will not be retried.
    ///
    /// A failed flush is logged and the records stay buffered for the next one.
    pub async fn record_failure(&mut self, record: &UploadRecord, error: &str, stage: FailureStage) {
        debug!(key = %record.key, stage = stage.as_str(), "Recording DLQ failure");

        self.stats.increment(stage);
        self.buffer.push(FailedUpload {
            local_path: record.local_path.clone(),
            key: record.key.clone(),
            error: error.to_string(),
            stage,
            retry_count: record.retry_count,
            timestamp: Utc::now(),
        });

        if self.buffer.len() >= BUFFER_SIZE
            && let Err(e) = self.flush().await
        {
            error!(error = %e, "Failed to flush DLQ");
        }
    }

    /// Write buffered records to a new NDJSON object.
    pub async fn flush(&mut self) -> Result<(), DlqError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut ndjson = String::new();
        for record in &self.buffer {
            let line = serde_json::to_string(record).context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        let path = Path::from(format!("{}-{:04}.ndjson", self.run_prefix, self.flushes));
        self.storage
            .put_payload(&path, PutPayload::from(Bytes::from(ndjson)))
            .await
            .context(DlqWriteSnafu)?;

        info!(records = self.buffer.len(), path = %path, "Flushed DLQ");
        self.flushes += 1;
        self.buffer.clear();
        Ok(())
    }

    /// Flush remaining records and return the failure statistics.
    pub async fn finalize(&mut self) -> Result<FailureStats, DlqError> {
        self.flush().await?;
        info!(
            total = self.stats.total(),
            read = self.stats.read,
            upload = self.stats.upload,
            "DLQ finalized"
        );
        Ok(self.stats)
    }
}
