//! Upload bookkeeping persisted in the reconciler checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

use crate::types::FinalizedFileMetadata;

/// Lifecycle of one upload.
///
/// `Pending -> InProgress -> Committed | Failed`, with `InProgress -> Pending`
/// after a transient failure while the retry budget lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    InProgress,
    Committed,
    Failed,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Committed | UploadState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Destination key; identifies the record.
    pub key: String,
    pub bucket: String,
    pub partition: usize,
    pub local_path: PathBuf,
    pub relative_path: String,
    pub size: u64,
    pub record_count: u64,
    pub state: UploadState,
    /// Failed attempts so far.
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Earliest time of the next attempt. Not persisted: recovered records
    /// are eligible immediately.
    #[serde(skip)]
    pub next_attempt_at: Option<Instant>,
}

impl UploadRecord {
    pub fn new(metadata: FinalizedFileMetadata, bucket: impl Into<String>) -> Self {
        Self {
            key: metadata.destination_key,
            bucket: bucket.into(),
            partition: metadata.partition,
            local_path: metadata.local_path,
            relative_path: metadata.relative_path,
            size: metadata.size,
            record_count: metadata.record_count,
            state: UploadState::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            next_attempt_at: None,
        }
    }

    /// Whether the record may be attempted at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.state == UploadState::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Whether the record is waiting out a backoff at `now`.
    pub fn is_backing_off(&self, now: Instant) -> bool {
        self.state == UploadState::Pending && self.next_attempt_at.is_some_and(|at| at > now)
    }
}
