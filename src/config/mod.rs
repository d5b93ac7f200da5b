//! Configuration loading and validation.
//!
//! Configuration is read once from YAML (after environment variable
//! interpolation), validated, and then shared read-only with both stages.

mod vars;

pub use vars::{interpolate, interpolate_with};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{
    ConfigError, EmptyAccessKeySnafu, EmptyBucketNameSnafu, EmptyOutputDirectorySnafu,
    EmptySecretAccessKeySnafu, EnvInterpolationSnafu, InvalidValueSnafu, ReadFileSnafu,
    YamlParseSnafu,
};

/// Byte size constants (binary/IEC units).
pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub s3: S3OutputConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

/// Destination bucket and credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct S3OutputConfig {
    pub access_key: String,
    pub secret_access_key: String,
    /// Region selector; falls back to the AWS SDK environment when unset.
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores (MinIO, Ceph RadosGW).
    #[serde(default)]
    pub endpoint: Option<String>,
    pub bucket_name: String,
    /// Key prefix; the relative path of each staged file is kept below it.
    pub output_directory_path: String,
}

impl std::fmt::Debug for S3OutputConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3OutputConfig")
            .field("access_key", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("bucket_name", &self.bucket_name)
            .field("output_directory_path", &self.output_directory_path)
            .finish()
    }
}

/// Rollover policy and local staging for the compactor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Working root for part files (default: "./flurry-staging").
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Finalize the open file after this many windows without new data (default: 30).
    #[serde(default = "default_max_idle_windows")]
    pub max_idle_windows: u64,

    /// Maximum part file length in bytes (default: 128 MiB).
    #[serde(default = "default_max_length")]
    pub max_length: u64,

    /// Close the OS handle of a part file not touched for this long.
    #[serde(default)]
    pub expire_stream_after_access_millis: Option<u64>,

    /// Finalize files after this many windows regardless of traffic (0 = disabled).
    #[serde(default)]
    pub rotation_windows: u64,

    /// Written after every record. None means records are concatenated.
    #[serde(default)]
    pub tuple_separator: Option<String>,

    /// Suffix of finalized part files (default: ".dat").
    #[serde(default = "default_file_extension")]
    pub file_extension: String,

    /// Number of compactor partitions (default: 1).
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Expose one input per partition instead of routing a single input.
    #[serde(default)]
    pub parallel_partition: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            max_idle_windows: default_max_idle_windows(),
            max_length: default_max_length(),
            expire_stream_after_access_millis: None,
            rotation_windows: 0,
            tuple_separator: None,
            file_extension: default_file_extension(),
            partitions: default_partitions(),
            parallel_partition: false,
        }
    }
}

impl CompactionConfig {
    pub fn separator_bytes(&self) -> &[u8] {
        self.tuple_separator
            .as_deref()
            .map(str::as_bytes)
            .unwrap_or_default()
    }

    pub fn expire_stream_after(&self) -> Option<Duration> {
        self.expire_stream_after_access_millis
            .map(Duration::from_millis)
    }
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("./flurry-staging")
}

fn default_max_idle_windows() -> u64 {
    30
}

fn default_max_length() -> u64 {
    128 * MB as u64
}

fn default_file_extension() -> String {
    ".dat".to_string()
}

fn default_partitions() -> usize {
    1
}

/// Upload, retry and recovery settings for the reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Retries after the first failed attempt before giving up (default: 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before the first retry in milliseconds (default: 200).
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the backoff in milliseconds (default: 30000).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Timeout for a single storage request in seconds, each multipart part
    /// bounded on its own (default: 60).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Delete the local file once its upload is committed (default: true).
    #[serde(default = "default_true")]
    pub delete_after_upload: bool,

    /// Time allowed to drain in-flight uploads on shutdown (default: 30).
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Target size per multipart part in MB (default: 32).
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: usize,

    /// Files smaller than this use a single PUT (default: 16).
    #[serde(default = "default_min_multipart_size_mb")]
    pub min_multipart_size_mb: usize,

    /// Maximum concurrent parts per multipart upload (default: 8).
    #[serde(default = "default_max_concurrent_parts")]
    pub max_concurrent_parts: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            delete_after_upload: true,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            part_size_mb: default_part_size_mb(),
            min_multipart_size_mb: default_min_multipart_size_mb(),
            max_concurrent_parts: default_max_concurrent_parts(),
        }
    }
}

impl ReconcilerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_part_size_mb() -> usize {
    32
}

fn default_min_multipart_size_mb() -> usize {
    16
}

fn default_max_concurrent_parts() -> usize {
    8
}

/// Tick driver and channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Length of one window in milliseconds (default: 500).
    #[serde(default = "default_window_millis")]
    pub window_millis: u64,

    /// Capacity of the record and metadata channels (default: 1024).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_millis: default_window_millis(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl PipelineConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_millis)
    }
}

fn default_window_millis() -> u64 {
    500
}

fn default_channel_capacity() -> usize {
    1024
}

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to serve metrics (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

/// Failure budget and dead letter queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Failed uploads tolerated before the pipeline stops (0 = unlimited).
    #[serde(default)]
    pub max_failures: usize,
    /// Where failed upload records are written as NDJSON.
    #[serde(default)]
    pub dlq_path: Option<String>,
    /// Storage options for the DLQ location.
    #[serde(default)]
    pub dlq_storage_options: HashMap<String, String>,
}

impl Config {
    /// Load configuration from a YAML file, interpolating environment variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let content = interpolate(content).map_err(|errors| {
            EnvInterpolationSnafu {
                message: errors.join("\n"),
            }
            .build()
        })?;

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on settings that would only surface once data is flowing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.s3.access_key.trim().is_empty(), EmptyAccessKeySnafu);
        ensure!(
            !self.s3.secret_access_key.trim().is_empty(),
            EmptySecretAccessKeySnafu
        );
        ensure!(!self.s3.bucket_name.trim().is_empty(), EmptyBucketNameSnafu);
        ensure!(
            !self.s3.output_directory_path.trim().is_empty(),
            EmptyOutputDirectorySnafu
        );
        ensure!(
            self.compaction.max_length >= 1,
            InvalidValueSnafu {
                field: "compaction.max_length",
                message: "must be at least 1",
            }
        );
        ensure!(
            self.compaction.partitions >= 1,
            InvalidValueSnafu {
                field: "compaction.partitions",
                message: "must be at least 1",
            }
        );
        ensure!(
            self.pipeline.window_millis >= 1,
            InvalidValueSnafu {
                field: "pipeline.window_millis",
                message: "must be at least 1",
            }
        );
        ensure!(
            self.pipeline.channel_capacity >= 1,
            InvalidValueSnafu {
                field: "pipeline.channel_capacity",
                message: "must be at least 1",
            }
        );
        ensure!(
            self.reconciler.part_size_mb >= 5,
            InvalidValueSnafu {
                field: "reconciler.part_size_mb",
                message: "S3 multipart parts must be at least 5 MB",
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
s3:
  access_key: AKIAEXAMPLE
  secret_access_key: secret
  bucket_name: metrics
  output_directory_path: tuples/out
"#;

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.compaction.max_idle_windows, 30);
        assert_eq!(config.compaction.max_length, 128 * 1024 * 1024);
        assert_eq!(config.compaction.rotation_windows, 0);
        assert!(config.compaction.tuple_separator.is_none());
        assert!(config.compaction.separator_bytes().is_empty());
        assert_eq!(config.compaction.partitions, 1);
        assert!(!config.compaction.parallel_partition);
        assert!(config.reconciler.delete_after_upload);
        assert!(config.s3.region.is_none());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
s3:
  access_key: AKIAEXAMPLE
  secret_access_key: secret
  region: eu-west-1
  bucket_name: metrics
  output_directory_path: tuples/out
compaction:
  max_idle_windows: 2
  max_length: 1024
  rotation_windows: 10
  tuple_separator: "\n"
  expire_stream_after_access_millis: 5000
  partitions: 4
  parallel_partition: true
reconciler:
  max_retries: 3
pipeline:
  window_millis: 100
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.s3.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.compaction.separator_bytes(), b"\n");
        assert_eq!(
            config.compaction.expire_stream_after(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(config.compaction.partitions, 4);
        assert!(config.compaction.parallel_partition);
        assert_eq!(config.reconciler.max_retries, 3);
        assert_eq!(config.pipeline.window(), Duration::from_millis(100));
    }

    #[test]
    fn test_missing_bucket_fails_fast() {
        let yaml = MINIMAL.replace("bucket_name: metrics", "bucket_name: \"\"");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyBucketName));
    }

    #[test]
    fn test_missing_credentials_fail_fast() {
        let yaml = MINIMAL.replace("access_key: AKIAEXAMPLE", "access_key: \" \"");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyAccessKey));
    }

    #[test]
    fn test_zero_max_length_rejected() {
        let yaml = format!("{MINIMAL}compaction:\n  max_length: 0\n");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        let rendered = format!("{:?}", config.s3);
        assert!(!rendered.contains("AKIAEXAMPLE"));
        assert!(!rendered.contains("secret\""));
    }
}
