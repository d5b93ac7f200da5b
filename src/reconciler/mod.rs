//! Durable upload of finalized part files.
//!
//! The reconciler tracks every finalized file as an [`UploadRecord`] and
//! drives it to `Committed` or `Failed`. Its queue is persisted through the
//! [`CheckpointManager`] on every state change, so a restart resumes uploads
//! that were pending or in flight. Uploads are idempotent: a re-attempt
//! overwrites the object with identical bytes.

mod record;
mod retry;

pub use record::{UploadRecord, UploadState};
pub use retry::{RetryPolicy, random_jitter};

use bytes::Bytes;
use chrono::Utc;
use snafu::prelude::*;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::ReconcilerConfig;
use crate::dlq::{DeadLetterQueue, FailureStage, FailureStats};
use crate::emit;
use crate::error::{DlqSnafu, ReadLocalSnafu, ReconcilerError, UploadSnafu};
use crate::metrics::events::{
    PendingUploads, RecoveredUploads, UploadCompleted, UploadFailed, UploadRetried,
};
use crate::storage::ObjectSink;
use crate::types::{FinalizedFileMetadata, UploadAcknowledgement, committed_path};

/// Counters across the lifetime of a reconciler.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcilerStats {
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub upload_retries: u64,
    pub upload_failures: u64,
}

/// What a call to [`Reconciler::process`] or [`Reconciler::drain`] produced.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// Committed uploads, in commit order.
    pub acknowledgements: Vec<UploadAcknowledgement>,
    /// Records that reached the `Failed` state.
    pub failures: Vec<UploadRecord>,
}

impl ProcessOutcome {
    pub fn is_empty(&self) -> bool {
        self.acknowledgements.is_empty() && self.failures.is_empty()
    }

    fn extend(&mut self, other: ProcessOutcome) {
        self.acknowledgements.extend(other.acknowledgements);
        self.failures.extend(other.failures);
    }
}

enum Attempt {
    Committed(UploadAcknowledgement),
    Retrying,
    Failed(UploadRecord),
}

pub struct Reconciler {
    sink: Arc<dyn ObjectSink>,
    config: ReconcilerConfig,
    retry: RetryPolicy,
    checkpoint: CheckpointManager,
    dlq: Option<DeadLetterQueue>,
    /// Non-terminal records in submission order.
    queue: Vec<UploadRecord>,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new(
        sink: Arc<dyn ObjectSink>,
        config: ReconcilerConfig,
        checkpoint: CheckpointManager,
        dlq: Option<DeadLetterQueue>,
    ) -> Self {
        Self {
            sink,
            retry: RetryPolicy::from(&config),
            config,
            checkpoint,
            dlq,
            queue: Vec::new(),
            stats: ReconcilerStats::default(),
        }
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    /// Number of records not yet committed or failed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn records(&self) -> &[UploadRecord] {
        &self.queue
    }

    /// Re-queue uploads left unfinished by a previous run.
    ///
    /// Records that were pending or in flight become pending again and are
    /// eligible immediately; their retry count is kept. Returns the number of
    /// re-queued records.
    pub async fn recover(&mut self) -> Result<usize, ReconcilerError> {
        if !self.checkpoint.load().await? {
            return Ok(0);
        }

        let mut recovered = 0;
        for mut record in self.checkpoint.take_records() {
            if record.state.is_terminal() || self.is_tracked(&record.key) {
                continue;
            }
            record.state = UploadState::Pending;
            record.next_attempt_at = None;
            self.queue.push(record);
            recovered += 1;
        }

        if recovered > 0 {
            emit!(RecoveredUploads {
                count: recovered as u64
            });
            info!(records = recovered, "Recovered uploads from checkpoint");
        }
        emit!(PendingUploads {
            count: self.queue.len()
        });
        Ok(recovered)
    }

    fn is_tracked(&self, key: &str) -> bool {
        self.queue.iter().any(|r| r.key == key)
    }

    /// Track a finalized file for upload and persist the queue.
    ///
    /// Returns `false` when the destination key is already tracked, or when
    /// the file was already committed and kept as `{name}.committed`.
    pub async fn submit(&mut self, metadata: FinalizedFileMetadata) -> Result<bool, ReconcilerError> {
        if self.is_tracked(&metadata.destination_key) {
            debug!(key = %metadata.destination_key, "Ignoring duplicate submission");
            return Ok(false);
        }
        if !exists(&metadata.local_path).await && exists(&committed_path(&metadata.local_path)).await {
            debug!(key = %metadata.destination_key, "Ignoring submission of committed file");
            return Ok(false);
        }

        let record = UploadRecord::new(metadata, self.sink.bucket());
        debug!(key = %record.key, bytes = record.size, partition = record.partition, "Queued upload");
        self.queue.push(record);
        self.persist().await?;

        emit!(PendingUploads {
            count: self.queue.len()
        });
        Ok(true)
    }

    /// Attempt every record that is due at `now`, in submission order.
    ///
    /// Once a record of a partition is waiting out a backoff, later records of
    /// the same partition wait too, so objects of one partition are committed
    /// in the order their files were finalized.
    pub async fn process(&mut self, now: Instant) -> Result<ProcessOutcome, ReconcilerError> {
        let mut outcome = ProcessOutcome::default();
        let mut blocked: HashSet<usize> = HashSet::new();
        let mut idx = 0;

        while idx < self.queue.len() {
            let record = &self.queue[idx];
            if blocked.contains(&record.partition) {
                idx += 1;
                continue;
            }
            if record.is_backing_off(now) {
                blocked.insert(record.partition);
                idx += 1;
                continue;
            }
            if !record.is_due(now) {
                idx += 1;
                continue;
            }

            let partition = record.partition;
            match self.upload(idx, now).await? {
                Attempt::Committed(ack) => outcome.acknowledgements.push(ack),
                Attempt::Failed(record) => outcome.failures.push(record),
                Attempt::Retrying => {
                    blocked.insert(partition);
                    idx += 1;
                }
            }
        }

        if !outcome.is_empty() {
            emit!(PendingUploads {
                count: self.queue.len()
            });
        }
        Ok(outcome)
    }

    /// Run [`Reconciler::process`] until the queue is empty or `grace` runs out.
    ///
    /// Records still queued afterwards remain in the checkpoint.
    pub async fn drain(&mut self, grace: Duration) -> Result<ProcessOutcome, ReconcilerError> {
        let deadline = Instant::now() + grace;
        let mut outcome = ProcessOutcome::default();

        loop {
            let now = Instant::now();
            outcome.extend(self.process(now).await?);

            if self.queue.is_empty() {
                break;
            }
            if now >= deadline {
                warn!(
                    remaining = self.queue.len(),
                    "Shutdown grace period elapsed with uploads outstanding"
                );
                break;
            }

            let next = self
                .next_attempt_at()
                .unwrap_or(now)
                .min(deadline)
                .max(now + Duration::from_millis(1));
            tokio::time::sleep_until(next.into()).await;
        }

        Ok(outcome)
    }

    /// Flush the dead letter queue, returning its statistics.
    pub async fn finish(&mut self) -> Result<Option<FailureStats>, ReconcilerError> {
        match self.dlq.as_mut() {
            Some(dlq) => Ok(Some(dlq.finalize().await.context(DlqSnafu)?)),
            None => Ok(None),
        }
    }

    fn next_attempt_at(&self) -> Option<Instant> {
        self.queue.iter().filter_map(|r| r.next_attempt_at).min()
    }

    async fn persist(&mut self) -> Result<(), ReconcilerError> {
        self.checkpoint.save(self.queue.iter()).await?;
        Ok(())
    }

    /// One attempt for the record at `idx`.
    async fn upload(&mut self, idx: usize, now: Instant) -> Result<Attempt, ReconcilerError> {
        self.queue[idx].state = UploadState::InProgress;
        self.persist().await?;

        let started = Instant::now();
        let result = self.put(&self.queue[idx]).await;

        match result {
            Ok(()) => {
                let mut record = self.queue.remove(idx);
                record.state = UploadState::Committed;
                self.persist().await?;
                Ok(Attempt::Committed(self.commit(record, started).await))
            }
            Err(e) if e.is_retryable() && self.retry.should_retry(self.queue[idx].retry_count + 1) => {
                let record = &mut self.queue[idx];
                record.retry_count += 1;
                let backoff = self.retry.backoff_with_jitter(record.retry_count);
                record.state = UploadState::Pending;
                record.next_attempt_at = Some(now + backoff);
                record.last_error = Some(e.to_string());

                emit!(UploadRetried {
                    attempt: record.retry_count
                });
                warn!(
                    key = %record.key,
                    attempt = record.retry_count,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Upload failed, will retry"
                );
                self.stats.upload_retries += 1;
                self.persist().await?;
                Ok(Attempt::Retrying)
            }
            Err(e) => {
                let mut record = self.queue.remove(idx);
                let permanent = !e.is_retryable();
                if !permanent {
                    record.retry_count += 1;
                }
                record.state = UploadState::Failed;
                record.last_error = Some(e.to_string());
                self.persist().await?;

                emit!(UploadFailed { permanent });
                error!(
                    key = %record.key,
                    path = %record.local_path.display(),
                    attempts = record.retry_count + u32::from(permanent),
                    permanent,
                    error = %e,
                    "Upload failed"
                );
                self.stats.upload_failures += 1;

                if let Some(dlq) = self.dlq.as_mut() {
                    let stage = match e {
                        ReconcilerError::ReadLocal { .. } => FailureStage::Read,
                        _ => FailureStage::Upload,
                    };
                    dlq.record_failure(&record, &e.to_string(), stage).await;
                }
                Ok(Attempt::Failed(record))
            }
        }
    }

    /// Read the local file and store it under the record's key.
    async fn put(&self, record: &UploadRecord) -> Result<(), ReconcilerError> {
        let data = tokio::fs::read(&record.local_path)
            .await
            .context(ReadLocalSnafu {
                path: &record.local_path,
            })?;

        // The sink bounds each request it makes; a large multipart upload is
        // not limited as a whole.
        self.sink
            .put_object(&record.key, Bytes::from(data))
            .await
            .context(UploadSnafu { key: &record.key })
    }

    /// Post-commit bookkeeping: local cleanup, metrics and the acknowledgement.
    async fn commit(&mut self, record: UploadRecord, started: Instant) -> UploadAcknowledgement {
        let duration = started.elapsed();
        emit!(UploadCompleted {
            bytes: record.size,
            duration,
        });
        self.stats.files_uploaded += 1;
        self.stats.bytes_uploaded += record.size;

        let local_path = self.retire_local_file(&record.local_path).await;

        info!(
            key = %record.key,
            bytes = record.size,
            attempts = record.retry_count + 1,
            duration_ms = duration.as_millis() as u64,
            "Upload committed"
        );

        UploadAcknowledgement {
            bucket: record.bucket,
            key: record.key,
            local_path,
            size: record.size,
            record_count: record.record_count,
            attempts: record.retry_count + 1,
            committed_at: Utc::now(),
        }
    }

    /// Delete a committed file, or rename it to `{name}.committed` so that
    /// recovery does not upload it again. Returns where the file now is.
    async fn retire_local_file(&self, path: &Path) -> PathBuf {
        if self.config.delete_after_upload {
            if let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to delete uploaded file");
            }
            return path.to_path_buf();
        }

        let committed = committed_path(path);
        match tokio::fs::rename(path, &committed).await {
            Ok(()) => committed,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to mark uploaded file as committed");
                path.to_path_buf()
            }
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::{StorageProvider, StorageProviderRef};
    use crate::types::FinalizeReason;
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use object_store::throttle::{ThrottleConfig, ThrottledStore};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Sink that fails according to a script, then stores objects in memory.
    #[derive(Default)]
    struct ScriptedSink {
        script: Mutex<VecDeque<StorageError>>,
        objects: Mutex<HashMap<String, Bytes>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedSink {
        fn failing(errors: impl IntoIterator<Item = StorageError>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(errors.into_iter().collect()),
                ..Default::default()
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn object(&self, key: &str) -> Option<Bytes> {
            self.objects.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl ObjectSink for ScriptedSink {
        fn bucket(&self) -> &str {
            "metrics"
        }

        async fn put_object(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
            self.calls.lock().unwrap().push(key.to_string());
            if let Some(err) = self.script.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.objects.lock().unwrap().insert(key.to_string(), data);
            Ok(())
        }
    }

    fn transient() -> StorageError {
        StorageError::ObjectStore {
            source: object_store::Error::Generic {
                store: "S3",
                source: "503 Slow Down".into(),
            },
        }
    }

    fn permanent() -> StorageError {
        StorageError::ObjectStore {
            source: object_store::Error::PermissionDenied {
                path: "metrics/out".to_string(),
                source: "403 Forbidden".into(),
            },
        }
    }

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            max_retries: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            ..Default::default()
        }
    }

    async fn checkpoint_storage(dir: &TempDir) -> StorageProviderRef {
        Arc::new(StorageProvider::local(dir.path()).await.unwrap())
    }

    async fn reconciler(
        dir: &TempDir,
        sink: Arc<dyn ObjectSink>,
        config: ReconcilerConfig,
    ) -> Reconciler {
        let checkpoint = CheckpointManager::new(checkpoint_storage(dir).await);
        Reconciler::new(sink, config, checkpoint, None)
    }

    fn staged(dir: &TempDir, partition: usize, name: &str, body: &[u8]) -> FinalizedFileMetadata {
        let relative_path = format!("partition={partition}/{name}");
        let local_path = dir.path().join(&relative_path);
        std::fs::create_dir_all(local_path.parent().unwrap()).unwrap();
        std::fs::write(&local_path, body).unwrap();
        FinalizedFileMetadata {
            partition,
            local_path,
            destination_key: format!("out/{relative_path}"),
            relative_path,
            size: body.len() as u64,
            record_count: 1,
            reason: FinalizeReason::Idle,
        }
    }

    fn later(now: Instant, secs: u64) -> Instant {
        now + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_upload_commits_and_deletes_local_file() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([]);
        let mut r = reconciler(&dir, sink.clone(), config()).await;

        let meta = staged(&dir, 0, "a.dat", b"a\nb\nc\n");
        let local = meta.local_path.clone();
        assert!(r.submit(meta).await.unwrap());

        let outcome = r.process(Instant::now()).await.unwrap();
        assert_eq!(outcome.acknowledgements.len(), 1);
        let ack = &outcome.acknowledgements[0];
        assert_eq!(ack.bucket, "metrics");
        assert_eq!(ack.key, "out/partition=0/a.dat");
        assert_eq!(ack.attempts, 1);

        assert_eq!(sink.object("out/partition=0/a.dat").unwrap().as_ref(), b"a\nb\nc\n");
        assert!(!local.exists());
        assert_eq!(r.pending(), 0);
        assert_eq!(r.stats().files_uploaded, 1);
    }

    #[tokio::test]
    async fn test_kept_file_is_marked_committed() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([]);
        let mut r = reconciler(
            &dir,
            sink,
            ReconcilerConfig {
                delete_after_upload: false,
                ..config()
            },
        )
        .await;

        let meta = staged(&dir, 0, "a.dat", b"kept");
        let local = meta.local_path.clone();
        r.submit(meta).await.unwrap();

        let outcome = r.process(Instant::now()).await.unwrap();
        let ack = &outcome.acknowledgements[0];
        assert_eq!(ack.local_path, committed_path(&local));
        assert!(!local.exists());
        assert_eq!(std::fs::read(&ack.local_path).unwrap(), b"kept");
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([transient()]);
        let mut r = reconciler(&dir, sink.clone(), config()).await;
        r.submit(staged(&dir, 0, "a.dat", b"x")).await.unwrap();

        let now = Instant::now();
        assert!(r.process(now).await.unwrap().is_empty());
        assert_eq!(r.records()[0].retry_count, 1);
        assert_eq!(r.records()[0].state, UploadState::Pending);

        // Still backing off.
        assert!(r.process(now).await.unwrap().is_empty());
        assert_eq!(sink.calls().len(), 1);

        let outcome = r.process(later(now, 10)).await.unwrap();
        assert_eq!(outcome.acknowledgements.len(), 1);
        assert_eq!(outcome.acknowledgements[0].attempts, 2);
        assert_eq!(r.stats().upload_retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_retried() {
        let dir = TempDir::new().unwrap();
        let slow = ThrottledStore::new(
            InMemory::new(),
            ThrottleConfig {
                wait_put_per_call: Duration::from_secs(10),
                ..Default::default()
            },
        );
        let sink = StorageProvider::from_stores("metrics", Arc::new(slow), None)
            .with_request_timeout(Duration::from_secs(1));
        let mut r = reconciler(&dir, Arc::new(sink), config()).await;
        let meta = staged(&dir, 0, "a.dat", b"x");
        let local = meta.local_path.clone();
        r.submit(meta).await.unwrap();

        assert!(r.process(Instant::now()).await.unwrap().is_empty());

        let record = &r.records()[0];
        assert_eq!(record.state, UploadState::Pending);
        assert_eq!(record.retry_count, 1);
        assert!(
            record.last_error.as_deref().unwrap().contains("timed out after 1s"),
            "{:?}",
            record.last_error
        );
        assert!(local.exists());
        assert_eq!(r.stats().upload_retries, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_ends_in_failed() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([transient(), transient(), transient()]);
        let mut r = reconciler(&dir, sink.clone(), config()).await;
        let meta = staged(&dir, 0, "a.dat", b"x");
        let local = meta.local_path.clone();
        r.submit(meta).await.unwrap();

        let now = Instant::now();
        assert!(r.process(now).await.unwrap().is_empty());
        assert!(r.process(later(now, 10)).await.unwrap().is_empty());
        let outcome = r.process(later(now, 20)).await.unwrap();

        assert!(outcome.acknowledgements.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].state, UploadState::Failed);
        assert_eq!(outcome.failures[0].retry_count, 3);
        assert_eq!(sink.calls().len(), 3);
        assert_eq!(r.pending(), 0);
        assert_eq!(r.stats().upload_failures, 1);
        // Never deleted before commit.
        assert!(local.exists());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([permanent()]);
        let dlq_storage = Arc::new(StorageProvider::in_memory("dlq"));
        let checkpoint = CheckpointManager::new(checkpoint_storage(&dir).await);
        let dlq = DeadLetterQueue::new(dlq_storage.clone(), "failures-test");
        let mut r = Reconciler::new(sink.clone(), config(), checkpoint, Some(dlq));

        r.submit(staged(&dir, 0, "a.dat", b"x")).await.unwrap();
        let outcome = r.process(Instant::now()).await.unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(sink.calls().len(), 1);

        let stats = r.finish().await.unwrap().unwrap();
        assert_eq!(stats.upload, 1);
        assert_eq!(
            dlq_storage.list_keys(None).await.unwrap(),
            vec!["failures-test-0000.ndjson"]
        );
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_permanently() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([]);
        let mut r = reconciler(&dir, sink.clone(), config()).await;

        let meta = staged(&dir, 0, "a.dat", b"x");
        std::fs::remove_file(&meta.local_path).unwrap();
        r.submit(meta).await.unwrap();

        let outcome = r.process(Instant::now()).await.unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_partition_order_is_kept_while_backing_off() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([transient()]);
        let mut r = reconciler(&dir, sink.clone(), config()).await;

        r.submit(staged(&dir, 0, "a.dat", b"a")).await.unwrap();
        r.submit(staged(&dir, 0, "b.dat", b"b")).await.unwrap();
        r.submit(staged(&dir, 1, "c.dat", b"c")).await.unwrap();

        let now = Instant::now();
        let first = r.process(now).await.unwrap();
        let keys: Vec<_> = first.acknowledgements.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(keys, ["out/partition=1/c.dat"]);

        let second = r.process(later(now, 10)).await.unwrap();
        let keys: Vec<_> = second.acknowledgements.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(keys, ["out/partition=0/a.dat", "out/partition=0/b.dat"]);

        assert_eq!(
            sink.calls(),
            [
                "out/partition=0/a.dat",
                "out/partition=1/c.dat",
                "out/partition=0/a.dat",
                "out/partition=0/b.dat",
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_ignored_and_reupload_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([]);
        let mut r = reconciler(
            &dir,
            sink.clone(),
            ReconcilerConfig {
                delete_after_upload: false,
                ..config()
            },
        )
        .await;

        let meta = staged(&dir, 0, "a.dat", b"same bytes");
        assert!(r.submit(meta.clone()).await.unwrap());
        assert!(!r.submit(meta.clone()).await.unwrap());
        assert_eq!(r.pending(), 1);
        r.process(Instant::now()).await.unwrap();

        // Redelivery of a file already marked committed is dropped.
        assert!(!r.submit(meta.clone()).await.unwrap());

        // A crash between commit and marking leaves the file in place; the
        // next upload writes the same object again.
        std::fs::write(&meta.local_path, b"same bytes").unwrap();
        assert!(r.submit(meta).await.unwrap());
        r.process(Instant::now()).await.unwrap();

        assert_eq!(sink.calls().len(), 2);
        assert_eq!(
            sink.object("out/partition=0/a.dat").unwrap().as_ref(),
            b"same bytes"
        );
    }

    #[tokio::test]
    async fn test_recover_requeues_in_progress_records() {
        let dir = TempDir::new().unwrap();
        let meta = staged(&dir, 0, "a.dat", b"x");

        // A previous run crashed while the upload was in flight.
        let mut record = UploadRecord::new(meta, "metrics");
        record.state = UploadState::InProgress;
        record.retry_count = 1;
        let mut committed = record.clone();
        committed.key = "out/partition=0/done.dat".to_string();
        committed.state = UploadState::Committed;
        CheckpointManager::new(checkpoint_storage(&dir).await)
            .save([&record, &committed])
            .await
            .unwrap();

        let sink = ScriptedSink::failing([]);
        let mut r = reconciler(&dir, sink.clone(), config()).await;
        assert_eq!(r.recover().await.unwrap(), 1);
        assert_eq!(r.records()[0].state, UploadState::Pending);
        assert_eq!(r.records()[0].retry_count, 1);

        let outcome = r.process(Instant::now()).await.unwrap();
        assert_eq!(outcome.acknowledgements.len(), 1);
        assert_eq!(outcome.acknowledgements[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_checkpoint_tracks_queue() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([]);
        let mut r = reconciler(&dir, sink, config()).await;
        r.submit(staged(&dir, 0, "a.dat", b"x")).await.unwrap();

        let path = Path::new("_flurry/reconciler_checkpoint.json");
        let saved: crate::checkpoint::CheckpointState =
            serde_json::from_slice(&std::fs::read(dir.path().join(path)).unwrap()).unwrap();
        assert_eq!(saved.records.len(), 1);

        r.process(Instant::now()).await.unwrap();
        let saved: crate::checkpoint::CheckpointState =
            serde_json::from_slice(&std::fs::read(dir.path().join(path)).unwrap()).unwrap();
        assert!(saved.records.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_out_backoff() {
        let dir = TempDir::new().unwrap();
        let sink = ScriptedSink::failing([transient()]);
        let mut r = reconciler(
            &dir,
            sink,
            ReconcilerConfig {
                initial_backoff_ms: 10,
                max_backoff_ms: 20,
                ..config()
            },
        )
        .await;
        r.submit(staged(&dir, 0, "a.dat", b"x")).await.unwrap();

        let outcome = r.drain(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome.acknowledgements.len(), 1);
        assert_eq!(r.pending(), 0);
    }
}
