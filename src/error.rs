//! Error types for flurry using snafu.
//!
//! Each stage has its own error enum with context selectors; `PipelineError`
//! aggregates them at the top level.

use snafu::prelude::*;
use std::path::PathBuf;

// ============ Storage Errors ============

/// Errors that can occur during object storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// Request did not complete within the configured timeout.
    #[snafu(display("Storage request timed out after {secs}s"))]
    Timeout { secs: u64 },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Auth failures, missing buckets and unsupported operations need an
    /// operator; everything else (throttling, 5xx, connection resets) is
    /// reported by the client as a generic error and is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Timeout { .. } => true,
            StorageError::ObjectStore { source } => !matches!(
                source,
                object_store::Error::NotFound { .. }
                    | object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::AlreadyExists { .. }
                    | object_store::Error::UnknownConfigurationKey { .. }
            ),
            StorageError::Io { source } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            StorageError::InvalidUrl { .. } | StorageError::S3Config { .. } => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Access key is missing.
    #[snafu(display("s3.access_key cannot be empty"))]
    EmptyAccessKey,

    /// Secret access key is missing.
    #[snafu(display("s3.secret_access_key cannot be empty"))]
    EmptySecretAccessKey,

    /// Bucket name is missing.
    #[snafu(display("s3.bucket_name cannot be empty"))]
    EmptyBucketName,

    /// Output directory is missing.
    #[snafu(display("s3.output_directory_path cannot be empty"))]
    EmptyOutputDirectory,

    /// A numeric option is out of range.
    #[snafu(display("Invalid value for {field}: {message}"))]
    InvalidValue { field: String, message: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============ Compactor Errors ============

/// Errors raised while staging records into local part files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CompactorError {
    /// Failed to create the partition staging directory.
    #[snafu(display("Failed to create staging directory {}: {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to open or append to a part file.
    #[snafu(display("Failed to write part file {}: {source}", path.display()))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to flush, sync or rename a part file during finalization.
    #[snafu(display("Failed to finalize part file {}: {source}", path.display()))]
    Finalize {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to scan the staging directory during recovery.
    #[snafu(display("Failed to recover staging directory {}: {source}", path.display()))]
    Recover {
        path: PathBuf,
        source: std::io::Error,
    },
}

// ============ Reconciler Errors ============

/// Errors raised while reconciling finalized files into the object store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReconcilerError {
    /// Failed to read the local file that should be uploaded.
    #[snafu(display("Failed to read local file {}: {source}", path.display()))]
    ReadLocal {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Upload to the object store failed.
    #[snafu(display("Upload of {key} failed: {source}"))]
    Upload { key: String, source: StorageError },

    /// Failed to persist or load reconciler checkpoint state.
    #[snafu(display("Checkpoint error: {source}"))]
    Checkpoint { source: CheckpointError },

    /// Dead letter queue error.
    #[snafu(display("DLQ error: {source}"))]
    Dlq { source: DlqError },
}

impl ReconcilerError {
    /// Whether an upload attempt that failed with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcilerError::Upload { source, .. } => source.is_retryable(),
            // A vanished local file will not come back on its own.
            ReconcilerError::ReadLocal { .. } => false,
            ReconcilerError::Checkpoint { .. } | ReconcilerError::Dlq { .. } => false,
        }
    }
}

// ============ Checkpoint Errors ============

/// Errors that can occur while persisting reconciler state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Storage operation for the checkpoint failed.
    #[snafu(display("Checkpoint storage error: {source}"))]
    CheckpointStorage { source: StorageError },

    /// Checkpoint state could not be serialized.
    #[snafu(display("Failed to serialize checkpoint: {source}"))]
    CheckpointSerialize { source: serde_json::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur during Dead Letter Queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix is intentional to avoid snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ: {source}"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize failed upload record.
    #[snafu(display("Failed to serialize DLQ record: {source}"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage: {source}"))]
    DlqStorage { source: StorageError },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Compactor error.
    #[snafu(display("Compactor error: {source}"))]
    Compactor { source: CompactorError },

    /// Reconciler error.
    #[snafu(display("Reconciler error: {source}"))]
    Reconciler { source: ReconcilerError },

    /// Task join error.
    #[snafu(display("Task join error: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Channel closed.
    #[snafu(display("Channel closed unexpectedly"))]
    ChannelClosed,

    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Maximum upload failures exceeded.
    #[snafu(display("Maximum failures exceeded: {count} failed uploads"))]
    MaxFailures { count: usize },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<CompactorError> for PipelineError {
    fn from(source: CompactorError) -> Self {
        PipelineError::Compactor { source }
    }
}

impl From<ReconcilerError> for PipelineError {
    fn from(source: ReconcilerError) -> Self {
        PipelineError::Reconciler { source }
    }
}

impl From<CheckpointError> for ReconcilerError {
    fn from(source: CheckpointError) -> Self {
        ReconcilerError::Checkpoint { source }
    }
}
