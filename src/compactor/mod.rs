//! Record compaction into rolling local part files.
//!
//! A `Compactor` owns one partition directory under the staging root and at
//! most one open part file in it. Records are converted to bytes and appended;
//! the file is finalized when one of the rolling policies fires:
//!
//! - **size**: the next record would push the file past `max_length`. The
//!   first record of a file is always accepted, even if it alone is larger.
//! - **idle**: `max_idle_windows` windows passed without a new record.
//! - **rotation**: the file is `rotation_windows` windows old (0 disables).
//!
//! # Framing
//!
//! Every record is followed by the configured separator, including the last
//! one in a file: `a`, `b`, `c` with `"\n"` produce `a\nb\nc\n`. Nothing is
//! written between files, so concatenating a partition's files in
//! finalization order reproduces the record stream exactly.

mod part_file;

use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CompactionConfig;
use crate::converter::Converter;
use crate::emit;
use crate::error::{CompactorError, CreateDirSnafu, FinalizeSnafu, RecoverSnafu, WriteSnafu};
use crate::metrics::events::{BytesStaged, PartFileFinalized, RecordsAccepted, StreamExpired};
use crate::types::{COMMITTED_SUFFIX, FinalizeReason, FinalizedFileMetadata, destination_key};

use part_file::{PartFile, TEMP_SUFFIX};

/// Counters for a single compactor partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactorStats {
    pub records_accepted: u64,
    pub bytes_staged: u64,
    pub files_finalized: u64,
}

/// Buffers records of one partition into rolling local files.
pub struct Compactor<T> {
    config: CompactionConfig,
    output_directory: String,
    partition: usize,
    partition_dir: PathBuf,
    converter: Arc<dyn Converter<T>>,
    current: Option<PartFile>,
    finalized: Vec<FinalizedFileMetadata>,
    stats: CompactorStats,
    /// Records and bytes accepted since the last window, for metrics.
    window_records: u64,
    window_bytes: u64,
}

impl<T> Compactor<T> {
    /// Create a compactor for `partition`, creating its staging directory.
    ///
    /// `output_directory` is the destination key prefix used to derive the
    /// key of every finalized file.
    pub fn new(
        config: CompactionConfig,
        output_directory: impl Into<String>,
        partition: usize,
        converter: Arc<dyn Converter<T>>,
    ) -> Result<Self, CompactorError> {
        let partition_dir = config.staging_dir.join(format!("partition={partition}"));
        std::fs::create_dir_all(&partition_dir).context(CreateDirSnafu {
            path: &partition_dir,
        })?;

        debug!(
            partition,
            dir = %partition_dir.display(),
            max_length = config.max_length,
            max_idle_windows = config.max_idle_windows,
            rotation_windows = config.rotation_windows,
            "Created compactor"
        );

        Ok(Self {
            config,
            output_directory: output_directory.into(),
            partition,
            partition_dir,
            converter,
            current: None,
            finalized: Vec::new(),
            stats: CompactorStats::default(),
            window_records: 0,
            window_bytes: 0,
        })
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn partition_dir(&self) -> &Path {
        &self.partition_dir
    }

    pub fn stats(&self) -> CompactorStats {
        self.stats
    }

    /// Length of the open part file, if any.
    pub fn current_length(&self) -> Option<u64> {
        self.current.as_ref().map(|f| f.length)
    }

    /// Append a record to the open part file, rolling over first if it would
    /// exceed `max_length`.
    ///
    /// A write failure abandons the open file: it stays on disk as a temp file
    /// and is promoted by [`Compactor::recover`] on the next start.
    pub fn accept(&mut self, record: &T) -> Result<(), CompactorError> {
        let data = self.converter.convert(record);
        let separator_len = self.config.separator_bytes().len() as u64;
        let needed = data.len() as u64 + separator_len;

        if let Some(file) = &self.current
            && file.record_count > 0
            && file.length + needed > self.config.max_length
        {
            self.finalize(FinalizeReason::Size)?;
        }

        if self.current.is_none() {
            let file = PartFile::create(
                &self.partition_dir,
                self.partition,
                &self.config.file_extension,
            )
            .context(WriteSnafu {
                path: &self.partition_dir,
            })?;
            debug!(partition = self.partition, file = %file.relative_path, "Opened part file");
            self.current = Some(file);
        }

        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };
        if let Err(source) = file.append(&data, self.config.separator_bytes()) {
            let path = file.temp_path.clone();
            self.current = None;
            return Err(CompactorError::Write { path, source });
        }

        self.stats.records_accepted += 1;
        self.stats.bytes_staged += needed;
        self.window_records += 1;
        self.window_bytes += needed;
        Ok(())
    }

    /// Close one window for the open file; finalize it once
    /// `max_idle_windows` windows in a row passed without a record.
    ///
    /// The window a record arrived in is not idle, it only resets the count.
    pub fn on_idle_tick(&mut self) -> Result<(), CompactorError> {
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };
        if std::mem::take(&mut file.written_in_window) {
            return Ok(());
        }
        file.idle_windows += 1;
        if file.record_count > 0 && file.idle_windows >= self.config.max_idle_windows {
            self.finalize(FinalizeReason::Idle)?;
        }
        Ok(())
    }

    /// Age the open file by one window; finalize it once it reaches
    /// `rotation_windows`. Does nothing when rotation is disabled.
    pub fn on_period_tick(&mut self) -> Result<(), CompactorError> {
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };
        file.age_windows += 1;
        let rotation = self.config.rotation_windows;
        if rotation > 0 && file.age_windows >= rotation {
            self.finalize(FinalizeReason::Rotation)?;
        }
        Ok(())
    }

    /// Window boundary housekeeping: rotation, idleness, then handle expiry.
    pub fn end_window(&mut self) -> Result<(), CompactorError> {
        self.flush_window_metrics();
        self.on_period_tick()?;
        self.on_idle_tick()?;
        self.expire_stream()
    }

    /// Close the OS handle of a file that has not been touched for
    /// `expire_stream_after_access_millis`. The part file stays open and is
    /// reopened in append mode by the next record.
    fn expire_stream(&mut self) -> Result<(), CompactorError> {
        let Some(expire_after) = self.config.expire_stream_after() else {
            return Ok(());
        };
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };
        if file.has_handle() && file.idle_for() >= expire_after {
            file.release_handle().context(WriteSnafu {
                path: &file.temp_path,
            })?;
            emit!(StreamExpired {
                partition: self.partition
            });
            debug!(partition = self.partition, file = %file.relative_path, "Expired part file handle");
        }
        Ok(())
    }

    /// Close the open part file and queue its metadata.
    ///
    /// A file without records is deleted instead; empty objects are never
    /// uploaded. No new file is opened until the next `accept`.
    pub fn finalize(&mut self, reason: FinalizeReason) -> Result<(), CompactorError> {
        let Some(file) = self.current.take() else {
            return Ok(());
        };

        if file.record_count == 0 {
            let path = file.temp_path.clone();
            return file.discard().context(FinalizeSnafu { path });
        }

        let temp_path = file.temp_path.clone();
        let file = file.finish().context(FinalizeSnafu { path: temp_path })?;

        let metadata = FinalizedFileMetadata {
            partition: self.partition,
            local_path: file.final_path.clone(),
            destination_key: destination_key(&self.output_directory, &file.relative_path),
            relative_path: file.relative_path,
            size: file.length,
            record_count: file.record_count,
            reason,
        };

        emit!(PartFileFinalized {
            reason,
            bytes: metadata.size,
        });
        info!(
            partition = self.partition,
            file = %metadata.relative_path,
            size = metadata.size,
            records = metadata.record_count,
            reason = reason.as_str(),
            "Finalized part file"
        );

        self.stats.files_finalized += 1;
        self.finalized.push(metadata);
        Ok(())
    }

    /// Take the metadata of files finalized since the last call, oldest first.
    pub fn take_finalized(&mut self) -> Vec<FinalizedFileMetadata> {
        std::mem::take(&mut self.finalized)
    }

    /// Finalize the open file (flush-on-close) and return all pending metadata.
    pub fn close(&mut self) -> Result<Vec<FinalizedFileMetadata>, CompactorError> {
        self.flush_window_metrics();
        self.finalize(FinalizeReason::Shutdown)?;
        Ok(self.take_finalized())
    }

    /// Pick up files left in the partition directory by a previous run.
    ///
    /// Non-empty temp files are promoted to their final name, empty ones are
    /// removed, and every finalized file still on disk is queued again. A
    /// committed file is either deleted or carries the `.committed` suffix, so
    /// neither is picked up. Must run before the first `accept`. Returns the
    /// number of queued files.
    pub fn recover(&mut self) -> Result<usize, CompactorError> {
        let dir = self.partition_dir.clone();
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .context(RecoverSnafu { path: &dir })?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        let open_temp = self.current.as_ref().map(|f| f.temp_path.clone());
        let mut recovered = 0;

        for name in names {
            let path = dir.join(&name);
            if open_temp.as_ref() == Some(&path) {
                continue;
            }

            let final_name = match name.strip_suffix(TEMP_SUFFIX) {
                Some(final_name) => {
                    let size = std::fs::metadata(&path)
                        .context(RecoverSnafu { path: &path })?
                        .len();
                    if size == 0 {
                        std::fs::remove_file(&path).context(RecoverSnafu { path: &path })?;
                        debug!(partition = self.partition, file = %name, "Removed empty temp file");
                        continue;
                    }
                    let final_path = dir.join(final_name);
                    std::fs::rename(&path, &final_path)
                        .context(RecoverSnafu { path: &path })?;
                    final_name.to_string()
                }
                None if name.ends_with(COMMITTED_SUFFIX) => continue,
                None if name.ends_with(&self.config.file_extension) => name,
                None => {
                    warn!(partition = self.partition, file = %name, "Ignoring unknown file in staging directory");
                    continue;
                }
            };

            let local_path = dir.join(&final_name);
            let size = std::fs::metadata(&local_path)
                .context(RecoverSnafu { path: &local_path })?
                .len();
            let relative_path = format!("partition={}/{}", self.partition, final_name);

            emit!(PartFileFinalized {
                reason: FinalizeReason::Recovered,
                bytes: size,
            });
            self.finalized.push(FinalizedFileMetadata {
                partition: self.partition,
                local_path,
                destination_key: destination_key(&self.output_directory, &relative_path),
                relative_path,
                size,
                record_count: 0,
                reason: FinalizeReason::Recovered,
            });
            recovered += 1;
        }

        if recovered > 0 {
            info!(
                partition = self.partition,
                files = recovered,
                "Recovered part files from staging directory"
            );
        }
        Ok(recovered)
    }

    fn flush_window_metrics(&mut self) {
        if self.window_records > 0 {
            emit!(RecordsAccepted {
                count: self.window_records,
                partition: self.partition,
            });
            emit!(BytesStaged {
                bytes: self.window_bytes,
                partition: self.partition,
            });
            self.window_records = 0;
            self.window_bytes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::StringConverter;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CompactionConfig {
        CompactionConfig {
            staging_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn compactor(config: CompactionConfig) -> Compactor<String> {
        Compactor::new(config, "tuples/out", 0, Arc::new(StringConverter)).unwrap()
    }

    fn feed(compactor: &mut Compactor<String>, records: &[&str]) {
        for r in records {
            compactor.accept(&r.to_string()).unwrap();
        }
    }

    fn concat(files: &[FinalizedFileMetadata]) -> Vec<u8> {
        files
            .iter()
            .flat_map(|f| std::fs::read(&f.local_path).unwrap())
            .collect()
    }

    #[test]
    fn test_idle_rollover_after_max_idle_windows() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            max_idle_windows: 2,
            tuple_separator: Some("\n".into()),
            ..config(&dir)
        });

        feed(&mut c, &["a", "b", "c"]);
        // Closes the window the records arrived in.
        c.on_idle_tick().unwrap();
        c.on_idle_tick().unwrap();
        assert!(c.take_finalized().is_empty());
        c.on_idle_tick().unwrap();

        let files = c.take_finalized();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].reason, FinalizeReason::Idle);
        assert_eq!(files[0].record_count, 3);
        assert_eq!(std::fs::read(&files[0].local_path).unwrap(), b"a\nb\nc\n");
        assert!(
            files[0]
                .destination_key
                .starts_with("tuples/out/partition=0/")
        );
        assert!(files[0].destination_key.ends_with(".dat"));
        assert_eq!(c.current_length(), None);
    }

    #[test]
    fn test_record_resets_idle_count() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            max_idle_windows: 2,
            ..config(&dir)
        });

        feed(&mut c, &["a"]);
        c.on_idle_tick().unwrap();
        c.on_idle_tick().unwrap();
        feed(&mut c, &["b"]);
        c.on_idle_tick().unwrap();
        c.on_idle_tick().unwrap();
        assert!(c.take_finalized().is_empty());
        c.on_idle_tick().unwrap();
        assert_eq!(c.take_finalized().len(), 1);
    }

    #[test]
    fn test_continuous_traffic_never_goes_idle() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            max_idle_windows: 1,
            ..config(&dir)
        });

        for i in 0..5 {
            feed(&mut c, &[&i.to_string()]);
            c.end_window().unwrap();
        }
        assert!(c.take_finalized().is_empty());
        assert_eq!(c.current_length(), Some(5));

        c.end_window().unwrap();
        let files = c.take_finalized();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].reason, FinalizeReason::Idle);
        assert_eq!(files[0].record_count, 5);
    }

    #[test]
    fn test_idle_count_starts_after_the_write_window() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            max_idle_windows: 2,
            ..config(&dir)
        });

        feed(&mut c, &["a"]);
        c.end_window().unwrap();
        c.end_window().unwrap();
        assert!(c.take_finalized().is_empty());

        c.end_window().unwrap();
        assert_eq!(c.take_finalized().len(), 1);
    }

    #[test]
    fn test_size_rollover_mid_record() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            max_length: 10,
            tuple_separator: Some("\n".into()),
            ..config(&dir)
        });

        // 4 + 4 = 8 bytes fit, the third record would make it 12.
        feed(&mut c, &["abc", "def", "ghi"]);
        let first = c.take_finalized();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].reason, FinalizeReason::Size);
        assert_eq!(first[0].size, 8);

        let rest = c.close().unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].reason, FinalizeReason::Shutdown);
        assert_ne!(first[0].destination_key, rest[0].destination_key);

        let all: Vec<_> = first.into_iter().chain(rest).collect();
        assert_eq!(concat(&all), b"abc\ndef\nghi\n");
    }

    #[test]
    fn test_no_file_exceeds_max_length_except_single_oversized_record() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            max_length: 16,
            tuple_separator: Some(",".into()),
            ..config(&dir)
        });

        let records = [
            "0123", "45", "6789abcdef", "this record is far too long", "x", "yz", "0123456789",
        ];
        feed(&mut c, &records);
        let files = c.close().unwrap();

        for f in &files {
            assert!(
                f.size <= 16 || f.record_count == 1,
                "{} has {} bytes in {} records",
                f.relative_path,
                f.size,
                f.record_count
            );
        }

        let expected: Vec<u8> = records.iter().flat_map(|r| format!("{r},").into_bytes()).collect();
        assert_eq!(concat(&files), expected);
    }

    #[test]
    fn test_rotation_disabled_means_no_time_based_rollover() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            rotation_windows: 0,
            ..config(&dir)
        });

        feed(&mut c, &["a"]);
        for _ in 0..100 {
            c.on_period_tick().unwrap();
        }
        assert!(c.take_finalized().is_empty());
        assert!(c.current_length().is_some());
    }

    #[test]
    fn test_rotation_under_continuous_traffic() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            rotation_windows: 3,
            max_idle_windows: 2,
            ..config(&dir)
        });

        // A record every window keeps the file from ever going idle.
        for i in 0..3 {
            feed(&mut c, &[&i.to_string()]);
            c.end_window().unwrap();
        }

        let files = c.take_finalized();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].reason, FinalizeReason::Rotation);
        assert_eq!(std::fs::read(&files[0].local_path).unwrap(), b"012");
    }

    #[test]
    fn test_ticks_without_records_never_finalize() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            max_idle_windows: 1,
            rotation_windows: 1,
            ..config(&dir)
        });

        for _ in 0..10 {
            c.end_window().unwrap();
        }
        assert!(c.take_finalized().is_empty());
        assert!(c.close().unwrap().is_empty());
    }

    #[test]
    fn test_expired_handle_is_reopened() {
        let dir = TempDir::new().unwrap();
        let mut c = compactor(CompactionConfig {
            expire_stream_after_access_millis: Some(0),
            ..config(&dir)
        });

        feed(&mut c, &["before"]);
        c.end_window().unwrap();
        assert!(!c.current.as_ref().unwrap().has_handle());

        feed(&mut c, &["after"]);
        let files = c.close().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0].local_path).unwrap(), b"beforeafter");
    }

    #[test]
    fn test_recover_promotes_temp_files_and_requeues_finalized() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);

        // A previous run: one finalized file and one abandoned open file.
        {
            let mut c = compactor(cfg.clone());
            feed(&mut c, &["done"]);
            c.finalize(FinalizeReason::Idle).unwrap();
            feed(&mut c, &["half"]);
            c.current.as_mut().unwrap().release_handle().unwrap();
            // Dropped without close: the open file stays as a temp file.
        }
        let partition_dir = dir.path().join("partition=0");
        std::fs::write(partition_dir.join("empty.dat.tmp"), b"").unwrap();
        std::fs::write(partition_dir.join("uploaded.dat.committed"), b"old").unwrap();

        let mut c = compactor(cfg);
        assert_eq!(c.recover().unwrap(), 2);

        let files = c.take_finalized();
        assert!(files.iter().all(|f| f.reason == FinalizeReason::Recovered));
        assert_eq!(concat(&files), b"donehalf");
        assert!(!partition_dir.join("empty.dat.tmp").exists());
        assert!(partition_dir.join("uploaded.dat.committed").exists());

        let leftovers: Vec<_> = std::fs::read_dir(&partition_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }
}
