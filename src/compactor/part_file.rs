//! A single append-only part file under construction.
//!
//! The file lives at `{name}.tmp` until it is finished, at which point it is
//! flushed, synced and renamed to `{name}`. A crash therefore never leaves a
//! half-written file under a final name.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub(crate) const TEMP_SUFFIX: &str = ".tmp";

const WRITE_BUFFER: usize = 64 * 1024;

#[derive(Debug)]
pub(crate) struct PartFile {
    pub relative_path: String,
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
    handle: Option<BufWriter<File>>,
    pub length: u64,
    pub record_count: u64,
    pub last_write_at: Instant,
    last_access_at: Instant,
    /// Consecutive closed windows without a record.
    pub idle_windows: u64,
    /// A record arrived in the window that is still open.
    pub written_in_window: bool,
    /// Windows since the file was created.
    pub age_windows: u64,
}

impl PartFile {
    /// Create a new, empty part file in `dir`.
    ///
    /// Names are UUIDv7 so that lexical order matches creation order.
    pub fn create(dir: &Path, partition: usize, extension: &str) -> std::io::Result<Self> {
        let name = format!("{}{}", Uuid::now_v7(), extension);
        let final_path = dir.join(&name);
        let temp_path = dir.join(format!("{name}{TEMP_SUFFIX}"));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let now = Instant::now();
        Ok(Self {
            relative_path: format!("partition={partition}/{name}"),
            final_path,
            temp_path,
            handle: Some(BufWriter::with_capacity(WRITE_BUFFER, file)),
            length: 0,
            record_count: 0,
            last_write_at: now,
            last_access_at: now,
            idle_windows: 0,
            written_in_window: false,
            age_windows: 0,
        })
    }

    /// Append one record followed by the separator.
    ///
    /// Reopens the file in append mode if its handle was expired.
    pub fn append(&mut self, record: &[u8], separator: &[u8]) -> std::io::Result<()> {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => {
                let file = OpenOptions::new().append(true).open(&self.temp_path)?;
                BufWriter::with_capacity(WRITE_BUFFER, file)
            }
        };
        let handle = self.handle.insert(handle);

        handle.write_all(record)?;
        handle.write_all(separator)?;

        let now = Instant::now();
        self.length += (record.len() + separator.len()) as u64;
        self.record_count += 1;
        self.last_write_at = now;
        self.last_access_at = now;
        self.idle_windows = 0;
        self.written_in_window = true;
        Ok(())
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access_at.elapsed()
    }

    /// Flush and release the OS handle, keeping the file open logically.
    pub fn release_handle(&mut self) -> std::io::Result<()> {
        if let Some(mut handle) = self.handle.take() {
            handle.flush()?;
        }
        Ok(())
    }

    /// Flush, sync and move the file to its final name.
    pub fn finish(mut self) -> std::io::Result<Self> {
        let file = match self.handle.take() {
            Some(handle) => handle.into_inner().map_err(|e| e.into_error())?,
            None => OpenOptions::new().append(true).open(&self.temp_path)?,
        };
        file.sync_all()?;
        drop(file);

        std::fs::rename(&self.temp_path, &self.final_path)?;
        Ok(self)
    }

    /// Remove the temp file of a part file that never received a record.
    pub fn discard(mut self) -> std::io::Result<()> {
        self.handle.take();
        std::fs::remove_file(&self.temp_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_finish() {
        let dir = TempDir::new().unwrap();
        let mut part = PartFile::create(dir.path(), 3, ".dat").unwrap();
        assert!(part.temp_path.exists());
        assert!(part.relative_path.starts_with("partition=3/"));
        assert!(part.relative_path.ends_with(".dat"));

        part.append(b"a", b"\n").unwrap();
        part.append(b"bc", b"\n").unwrap();
        assert_eq!(part.length, 5);
        assert_eq!(part.record_count, 2);
        assert!(part.written_in_window);

        let done = part.finish().unwrap();
        assert!(!done.temp_path.exists());
        assert_eq!(std::fs::read(&done.final_path).unwrap(), b"a\nbc\n");
    }

    #[test]
    fn test_released_handle_reopens_in_append_mode() {
        let dir = TempDir::new().unwrap();
        let mut part = PartFile::create(dir.path(), 0, ".dat").unwrap();

        part.append(b"first", b"").unwrap();
        part.release_handle().unwrap();
        assert!(!part.has_handle());

        part.append(b"second", b"").unwrap();
        assert!(part.has_handle());

        let done = part.finish().unwrap();
        assert_eq!(std::fs::read(&done.final_path).unwrap(), b"firstsecond");
    }

    #[test]
    fn test_discard_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let part = PartFile::create(dir.path(), 0, ".dat").unwrap();
        let temp = part.temp_path.clone();
        part.discard().unwrap();
        assert!(!temp.exists());
    }
}
