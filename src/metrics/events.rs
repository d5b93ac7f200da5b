//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which records the corresponding
//! Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::types::FinalizeReason;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Compactor events
// ============================================================================

/// Event emitted when records are appended to a part file.
pub struct RecordsAccepted {
    pub count: u64,
    pub partition: usize,
}

impl InternalEvent for RecordsAccepted {
    fn emit(self) {
        trace!(count = self.count, partition = self.partition, "Records accepted");
        counter!("flurry_records_accepted_total", "partition" => self.partition.to_string())
            .increment(self.count);
    }
}

/// Event emitted when bytes are written to local staging.
pub struct BytesStaged {
    pub bytes: u64,
    pub partition: usize,
}

impl InternalEvent for BytesStaged {
    fn emit(self) {
        trace!(bytes = self.bytes, partition = self.partition, "Bytes staged");
        counter!("flurry_bytes_staged_total", "partition" => self.partition.to_string())
            .increment(self.bytes);
    }
}

/// Event emitted when a part file is closed for writing.
pub struct PartFileFinalized {
    pub reason: FinalizeReason,
    pub bytes: u64,
}

impl InternalEvent for PartFileFinalized {
    fn emit(self) {
        trace!(
            reason = self.reason.as_str(),
            bytes = self.bytes,
            "Part file finalized"
        );
        counter!("flurry_part_files_finalized_total", "reason" => self.reason.as_str())
            .increment(1);
        histogram!("flurry_part_file_size_bytes").record(self.bytes as f64);
    }
}

/// Event emitted when an open file handle is closed after sitting idle.
pub struct StreamExpired {
    pub partition: usize,
}

impl InternalEvent for StreamExpired {
    fn emit(self) {
        trace!(partition = self.partition, "Part file handle expired");
        counter!("flurry_stream_expirations_total").increment(1);
    }
}

// ============================================================================
// Reconciler events
// ============================================================================

/// Event emitted when an upload commits.
pub struct UploadCompleted {
    pub bytes: u64,
    pub duration: Duration,
}

impl InternalEvent for UploadCompleted {
    fn emit(self) {
        trace!(
            bytes = self.bytes,
            duration_ms = self.duration.as_millis(),
            "Upload completed"
        );
        counter!("flurry_uploads_total", "status" => "committed").increment(1);
        counter!("flurry_bytes_uploaded_total").increment(self.bytes);
        histogram!("flurry_upload_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a transient upload failure is scheduled for retry.
pub struct UploadRetried {
    pub attempt: u32,
}

impl InternalEvent for UploadRetried {
    fn emit(self) {
        trace!(attempt = self.attempt, "Upload retried");
        counter!("flurry_upload_retries_total").increment(1);
    }
}

/// Event emitted when an upload reaches the terminal failed state.
pub struct UploadFailed {
    pub permanent: bool,
}

impl InternalEvent for UploadFailed {
    fn emit(self) {
        let cause = if self.permanent {
            "permanent"
        } else {
            "retries_exhausted"
        };
        trace!(cause, "Upload failed");
        counter!("flurry_uploads_total", "status" => "failed", "cause" => cause).increment(1);
    }
}

/// Gauge of upload records not yet in a terminal state.
pub struct PendingUploads {
    pub count: usize,
}

impl InternalEvent for PendingUploads {
    fn emit(self) {
        trace!(count = self.count, "Pending uploads");
        gauge!("flurry_pending_uploads").set(self.count as f64);
    }
}

/// Event emitted when reconciler state is persisted.
pub struct CheckpointSaved;

impl InternalEvent for CheckpointSaved {
    fn emit(self) {
        trace!("Checkpoint saved");
        counter!("flurry_checkpoints_saved_total").increment(1);
    }
}

/// Event emitted when records are re-queued from a checkpoint at startup.
pub struct RecoveredUploads {
    pub count: u64,
}

impl InternalEvent for RecoveredUploads {
    fn emit(self) {
        trace!(count = self.count, "Recovered uploads");
        counter!("flurry_recovered_uploads_total").increment(self.count);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    Rename,
    List,
    CreateMultipart,
    PutPart,
    CompleteMultipart,
    AbortMultipart,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::Rename => "rename",
            StorageOperation::List => "list",
            StorageOperation::CreateMultipart => "create_multipart",
            StorageOperation::PutPart => "put_part",
            StorageOperation::CompleteMultipart => "complete_multipart",
            StorageOperation::AbortMultipart => "abort_multipart",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "flurry_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "flurry_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Gauge of multipart parts currently in flight.
pub struct ActiveMultipartParts {
    pub count: usize,
}

impl InternalEvent for ActiveMultipartParts {
    fn emit(self) {
        gauge!("flurry_active_multipart_parts").set(self.count as f64);
    }
}
