//! flurry: durable buffered writes to S3.
//!
//! Records are compacted into rolling part files on local disk and then
//! reconciled into an S3 bucket with retries and crash recovery. A record is
//! acknowledged only once the object that holds it is committed.
//!
//! # Example
//!
//! ```ignore
//! use flurry::{Config, OutputModule, error::PipelineError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PipelineError> {
//!     let config = Config::from_file("flurry.yaml")?;
//!     let mut module = OutputModule::strings(config).start().await?;
//!
//!     module.input().send("cpu=0.93".to_string()).await.ok();
//!     module.inputs.clear();
//!
//!     while let Some(ack) = module.output.recv().await {
//!         println!("committed s3://{}/{}", ack.bucket, ack.key);
//!     }
//!     module.join().await?;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod compactor;
pub mod config;
pub mod converter;
pub mod dlq;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod reconciler;
pub mod signal;
pub mod storage;
pub mod types;

pub use config::Config;
pub use converter::{BytesConverter, Converter, StringConverter};
pub use pipeline::{OutputModule, PipelineStats, RunningModule};
pub use storage::{ObjectSink, StorageProvider, StorageProviderRef};
pub use types::{FinalizeReason, FinalizedFileMetadata, UploadAcknowledgement};
