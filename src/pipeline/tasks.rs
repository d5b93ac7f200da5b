//! Background tasks of a running output module.
//!
//! Data flows `router -> compactor (one per partition) -> reconciler`. The
//! compactors listen to the shutdown token; the reconciler does not. It exits
//! once every compactor has dropped its metadata sender, so files flushed on
//! close are still uploaded before it drains and stops.

use snafu::prelude::*;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compactor::{Compactor, CompactorStats};
use crate::error::{MaxFailuresSnafu, PipelineError};
use crate::reconciler::{ProcessOutcome, Reconciler, ReconcilerStats};
use crate::types::{FinalizedFileMetadata, UploadAcknowledgement};

fn window_ticker(window: Duration) -> Interval {
    // The first tick is one window out; an immediate tick would count as idle.
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub(super) struct CompactorTask<T> {
    pub compactor: Compactor<T>,
    pub records: mpsc::Receiver<T>,
    pub finalized: mpsc::Sender<FinalizedFileMetadata>,
    pub window: Duration,
    pub shutdown: CancellationToken,
}

impl<T: Send + 'static> CompactorTask<T> {
    pub async fn run(mut self) -> Result<CompactorStats, PipelineError> {
        let partition = self.compactor.partition();
        let mut ticker = window_ticker(self.window);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    // Records already handed over are still written.
                    while let Ok(record) = self.records.try_recv() {
                        self.compactor.accept(&record)?;
                    }
                    debug!(partition, "Shutdown requested, closing compactor");
                    break;
                }

                _ = ticker.tick() => {
                    self.compactor.end_window()?;
                }

                record = self.records.recv() => {
                    let Some(record) = record else {
                        debug!(partition, "Input closed, closing compactor");
                        break;
                    };
                    self.compactor.accept(&record)?;
                }
            }

            self.forward().await?;
        }

        for metadata in self.compactor.close()? {
            send_finalized(&self.finalized, metadata).await?;
        }
        Ok(self.compactor.stats())
    }

    async fn forward(&mut self) -> Result<(), PipelineError> {
        for metadata in self.compactor.take_finalized() {
            send_finalized(&self.finalized, metadata).await?;
        }
        Ok(())
    }
}

async fn send_finalized(
    tx: &mpsc::Sender<FinalizedFileMetadata>,
    metadata: FinalizedFileMetadata,
) -> Result<(), PipelineError> {
    tx.send(metadata).await.map_err(|e| {
        warn!(
            file = %e.0.relative_path,
            "Reconciler stopped; file stays staged for the next start"
        );
        PipelineError::ChannelClosed
    })
}

pub(super) struct ReconcilerTask {
    pub reconciler: Reconciler,
    pub finalized: mpsc::Receiver<FinalizedFileMetadata>,
    pub acks: mpsc::Sender<UploadAcknowledgement>,
    pub window: Duration,
    pub grace: Duration,
    /// Failed uploads tolerated before stopping (0 = unlimited).
    pub max_failures: usize,
}

impl ReconcilerTask {
    pub async fn run(mut self) -> Result<ReconcilerStats, PipelineError> {
        let mut ticker = window_ticker(self.window);

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    let outcome = self.reconciler.process(Instant::now()).await?;
                    self.deliver(outcome).await?;
                }

                metadata = self.finalized.recv() => {
                    let Some(metadata) = metadata else {
                        break;
                    };
                    self.reconciler.submit(metadata).await?;
                }
            }
        }

        info!(
            pending = self.reconciler.pending(),
            grace_secs = self.grace.as_secs(),
            "Compactors closed, draining uploads"
        );
        let outcome = self.reconciler.drain(self.grace).await?;
        self.deliver(outcome).await?;
        self.reconciler.finish().await?;

        Ok(self.reconciler.stats())
    }

    async fn deliver(&mut self, outcome: ProcessOutcome) -> Result<(), PipelineError> {
        for ack in outcome.acknowledgements {
            if let Err(e) = self.acks.send(ack).await {
                debug!(key = %e.0.key, "Acknowledgement receiver dropped");
            }
        }

        let failures = self.reconciler.stats().upload_failures as usize;
        ensure!(
            self.max_failures == 0 || failures <= self.max_failures,
            MaxFailuresSnafu { count: failures }
        );
        Ok(())
    }
}

/// Spread records from a single input round-robin over the partitions.
pub(super) async fn run_router<T: Send + 'static>(
    mut input: mpsc::Receiver<T>,
    partitions: Vec<mpsc::Sender<T>>,
    shutdown: CancellationToken,
) {
    let mut next = 0;
    loop {
        let record = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            record = input.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        if partitions[next].send(record).await.is_err() {
            warn!(partition = next, "Compactor stopped, router exiting");
            break;
        }
        next = (next + 1) % partitions.len();
    }
}
