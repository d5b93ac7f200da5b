//! Types exchanged between the compactor and the reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Why a part file was closed for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeReason {
    /// The next record would have pushed the file past `max_length`.
    Size,
    /// No records arrived for `max_idle_windows` windows.
    Idle,
    /// The file reached `rotation_windows` windows of age.
    Rotation,
    /// Graceful shutdown flushed the open file.
    Shutdown,
    /// Found on disk at startup (left behind by a previous run).
    Recovered,
}

impl FinalizeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizeReason::Size => "size",
            FinalizeReason::Idle => "idle",
            FinalizeReason::Rotation => "rotation",
            FinalizeReason::Shutdown => "shutdown",
            FinalizeReason::Recovered => "recovered",
        }
    }
}

/// A part file that is closed for writing and ready for upload.
///
/// Produced by the compactor and handed over to the reconciler; the file at
/// `local_path` is not modified again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedFileMetadata {
    /// Compactor partition that wrote the file.
    pub partition: usize,
    /// Absolute path of the finalized file.
    pub local_path: PathBuf,
    /// Path relative to the compactor working root, e.g. `partition=0/{uuid}.dat`.
    pub relative_path: String,
    /// Object key in the destination bucket.
    pub destination_key: String,
    /// Size in bytes.
    pub size: u64,
    /// Number of records in the file (0 when unknown after recovery).
    pub record_count: u64,
    pub reason: FinalizeReason,
}

/// Emitted once a finalized file is durably stored in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAcknowledgement {
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub record_count: u64,
    /// Number of attempts it took, including the successful one.
    pub attempts: u32,
    pub committed_at: DateTime<Utc>,
}

/// Derive the destination key for a file staged at `relative_path`.
///
/// The directory structure below the compactor working root is preserved
/// under `output_directory`.
pub fn destination_key(output_directory: &str, relative_path: &str) -> String {
    let dir = output_directory.trim_matches('/');
    let rel = relative_path.trim_start_matches('/');
    if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{dir}/{rel}")
    }
}

/// Suffix of a part file that was uploaded but kept on disk
/// (`delete_after_upload: false`). Recovery skips these files.
pub const COMMITTED_SUFFIX: &str = ".committed";

/// Where a committed part file is kept: `{local_path}.committed`.
pub fn committed_path(local_path: &Path) -> PathBuf {
    let mut path = local_path.as_os_str().to_owned();
    path.push(COMMITTED_SUFFIX);
    PathBuf::from(path)
}
