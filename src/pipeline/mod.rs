//! Output module assembly.
//!
//! An [`OutputModule`] wires the stages together:
//!
//! ```text
//! inputs ──▶ [router] ──▶ compactor × N ──(write-to-s3)──▶ reconciler ──▶ output
//! ```
//!
//! Starting it validates the configuration, recovers state left by a
//! previous run and spawns one task per compactor partition plus one
//! reconciler task. The [`RunningModule`] exposes the input senders and the
//! acknowledgement receiver.

mod tasks;

use snafu::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::checkpoint::CheckpointManager;
use crate::compactor::{Compactor, CompactorStats};
use crate::config::Config;
use crate::converter::{BytesConverter, Converter, StringConverter};
use crate::dlq::DeadLetterQueue;
use crate::error::{PipelineError, ReconcilerError, TaskJoinSnafu};
use crate::reconciler::{Reconciler, ReconcilerStats};
use crate::storage::{MultipartOptions, ObjectSink, StorageProvider};
use crate::types::UploadAcknowledgement;

use tasks::{CompactorTask, ReconcilerTask, run_router};

/// Statistics about a module run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub records_accepted: u64,
    pub files_finalized: u64,
    pub bytes_staged: u64,
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub upload_retries: u64,
    pub upload_failures: u64,
}

impl PipelineStats {
    fn add_compactor(&mut self, stats: CompactorStats) {
        self.records_accepted += stats.records_accepted;
        self.files_finalized += stats.files_finalized;
        self.bytes_staged += stats.bytes_staged;
    }

    fn add_reconciler(&mut self, stats: ReconcilerStats) {
        self.files_uploaded += stats.files_uploaded;
        self.bytes_uploaded += stats.bytes_uploaded;
        self.upload_retries += stats.upload_retries;
        self.upload_failures += stats.upload_failures;
    }
}

/// Builder for a compactor + reconciler pipeline over records of type `T`.
pub struct OutputModule<T> {
    config: Config,
    converter: Arc<dyn Converter<T>>,
    sink: Option<Arc<dyn ObjectSink>>,
    shutdown: CancellationToken,
}

impl OutputModule<Vec<u8>> {
    /// Module whose records are raw bytes.
    pub fn bytes(config: Config) -> Self {
        Self::new(config, BytesConverter)
    }
}

impl OutputModule<String> {
    /// Module whose records are UTF-8 strings.
    pub fn strings(config: Config) -> Self {
        Self::new(config, StringConverter)
    }
}

impl<T: Send + 'static> OutputModule<T> {
    pub fn new(config: Config, converter: impl Converter<T> + 'static) -> Self {
        Self {
            config,
            converter: Arc::new(converter),
            sink: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Upload through `sink` instead of the S3 bucket from the configuration.
    pub fn with_sink(mut self, sink: Arc<dyn ObjectSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use an externally owned shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Recover, spawn the stage tasks and return the running module.
    pub async fn start(self) -> Result<RunningModule<T>, PipelineError> {
        let config = self.config;
        config.validate()?;

        let sink: Arc<dyn ObjectSink> = match self.sink {
            Some(sink) => sink,
            None => {
                let storage = StorageProvider::for_s3(&config.s3)
                    .await?
                    .with_multipart(MultipartOptions::from(&config.reconciler))
                    .with_request_timeout(config.reconciler.request_timeout());
                info!(
                    destination = storage.canonical_url(),
                    prefix = %config.s3.output_directory_path,
                    "Uploading to object store"
                );
                Arc::new(storage)
            }
        };

        let staging = StorageProvider::local(&config.compaction.staging_dir).await?;
        let checkpoint = CheckpointManager::new(Arc::new(staging));
        let dlq = DeadLetterQueue::from_config(&config.error_handling)
            .await
            .map_err(|source| ReconcilerError::Dlq { source })?;

        let mut reconciler = Reconciler::new(sink, config.reconciler.clone(), checkpoint, dlq);
        let recovered = reconciler.recover().await?;

        let partitions = config.compaction.partitions;
        let mut compactors = Vec::with_capacity(partitions);
        let mut recovered_files = 0;
        for partition in 0..partitions {
            let mut compactor = Compactor::new(
                config.compaction.clone(),
                config.s3.output_directory_path.clone(),
                partition,
                self.converter.clone(),
            )?;
            recovered_files += compactor.recover()?;
            for metadata in compactor.take_finalized() {
                reconciler.submit(metadata).await?;
            }
            compactors.push(compactor);
        }

        info!(
            partitions,
            parallel_partition = config.compaction.parallel_partition,
            recovered_uploads = recovered,
            recovered_files,
            pending = reconciler.pending(),
            "Starting output module"
        );

        let window = config.pipeline.window();
        let capacity = config.pipeline.channel_capacity;
        let shutdown = self.shutdown;

        let (finalized_tx, finalized_rx) = mpsc::channel(capacity);
        let (ack_tx, ack_rx) = mpsc::channel(capacity);

        let reconciler_task = ReconcilerTask {
            reconciler,
            finalized: finalized_rx,
            acks: ack_tx,
            window,
            grace: config.reconciler.shutdown_grace(),
            max_failures: config.error_handling.max_failures,
        };
        let reconciler_handle = spawn_stage(shutdown.clone(), reconciler_task.run());

        let mut partition_inputs = Vec::with_capacity(partitions);
        let mut compactor_handles = Vec::with_capacity(partitions);
        for compactor in compactors {
            let (record_tx, record_rx) = mpsc::channel(capacity);
            partition_inputs.push(record_tx);
            let task = CompactorTask {
                compactor,
                records: record_rx,
                finalized: finalized_tx.clone(),
                window,
                shutdown: shutdown.clone(),
            };
            compactor_handles.push(spawn_stage(shutdown.clone(), task.run()));
        }
        drop(finalized_tx);

        let (inputs, router) = if !config.compaction.parallel_partition && partitions > 1 {
            let (input_tx, input_rx) = mpsc::channel(capacity);
            let router = tokio::spawn(run_router(input_rx, partition_inputs, shutdown.clone()));
            (vec![input_tx], Some(router))
        } else {
            (partition_inputs, None)
        };

        Ok(RunningModule {
            inputs,
            output: ack_rx,
            shutdown,
            compactors: compactor_handles,
            reconciler: reconciler_handle,
            router,
        })
    }
}

/// Spawn a stage; a failing stage cancels the others.
fn spawn_stage<S, F>(shutdown: CancellationToken, stage: F) -> JoinHandle<Result<S, PipelineError>>
where
    S: Send + 'static,
    F: Future<Output = Result<S, PipelineError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = stage.await;
        if let Err(e) = &result {
            error!(error = %e, "Pipeline stage failed, shutting down");
            shutdown.cancel();
        }
        result
    })
}

/// A started output module.
///
/// Dropping every input sender (or calling [`RunningModule::shutdown`])
/// closes the compactors; the reconciler then drains and closes `output`.
pub struct RunningModule<T> {
    /// One sender per partition, or a single routed sender.
    pub inputs: Vec<mpsc::Sender<T>>,
    /// Acknowledgements of committed uploads.
    pub output: mpsc::Receiver<UploadAcknowledgement>,
    shutdown: CancellationToken,
    compactors: Vec<JoinHandle<Result<CompactorStats, PipelineError>>>,
    reconciler: JoinHandle<Result<ReconcilerStats, PipelineError>>,
    router: Option<JoinHandle<()>>,
}

impl<T> RunningModule<T> {
    /// The first input sender.
    pub fn input(&self) -> &mpsc::Sender<T> {
        &self.inputs[0]
    }

    /// Request graceful shutdown: compactors flush, the reconciler drains.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for every task to finish.
    ///
    /// Drops the module's input senders and acknowledgement receiver first;
    /// acknowledgements not yet received are only logged. Returns the
    /// reconciler's error in preference to a compactor's.
    pub async fn join(self) -> Result<PipelineStats, PipelineError> {
        let RunningModule {
            inputs,
            output,
            compactors,
            reconciler,
            router,
            ..
        } = self;
        drop(inputs);
        drop(output);

        let mut stats = PipelineStats::default();
        let mut compactor_error = None;

        if let Some(router) = router {
            router.await.context(TaskJoinSnafu)?;
        }

        for handle in compactors {
            match handle.await.context(TaskJoinSnafu)? {
                Ok(compactor_stats) => stats.add_compactor(compactor_stats),
                Err(e) => {
                    compactor_error.get_or_insert(e);
                }
            }
        }

        stats.add_reconciler(reconciler.await.context(TaskJoinSnafu)??);
        if let Some(e) = compactor_error {
            return Err(e);
        }

        info!(
            records = stats.records_accepted,
            files = stats.files_finalized,
            uploaded = stats.files_uploaded,
            failures = stats.upload_failures,
            "Output module stopped"
        );
        Ok(stats)
    }
}
