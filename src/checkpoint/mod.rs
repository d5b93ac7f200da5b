//! Persistence of reconciler state across restarts.
//!
//! The checkpoint lives at `{staging_dir}/_flurry/reconciler_checkpoint.json`
//! and is replaced atomically:
//! 1. Write to `reconciler_checkpoint.json.tmp`
//! 2. Rename to `reconciler_checkpoint.json`
//!
//! A crash mid-save leaves the previous checkpoint intact.

pub mod state;

pub use state::CheckpointState;

use object_store::path::Path;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{CheckpointError, CheckpointSerializeSnafu, CheckpointStorageSnafu};
use crate::metrics::events::CheckpointSaved;
use crate::reconciler::UploadRecord;
use crate::storage::StorageProviderRef;

/// Directory for flurry's own files within the staging root.
pub const CHECKPOINT_DIR: &str = "_flurry";

const CHECKPOINT_FILE: &str = "reconciler_checkpoint.json";

/// Loads and saves the reconciler checkpoint.
pub struct CheckpointManager {
    storage: StorageProviderRef,
    state: CheckpointState,
}

impl CheckpointManager {
    /// Create a manager writing below the root of `storage`.
    pub fn new(storage: StorageProviderRef) -> Self {
        Self {
            storage,
            state: CheckpointState::default(),
        }
    }

    fn checkpoint_path() -> Path {
        Path::from(format!("{CHECKPOINT_DIR}/{CHECKPOINT_FILE}"))
    }

    /// Load the checkpoint from storage.
    ///
    /// Returns `Ok(false)` when there is no checkpoint. A checkpoint that
    /// cannot be parsed is logged and treated as empty; the staging scan
    /// still finds every file that was not committed.
    pub async fn load(&mut self) -> Result<bool, CheckpointError> {
        match self.storage.get(Self::checkpoint_path()).await {
            Ok(bytes) => match serde_json::from_slice::<CheckpointState>(&bytes) {
                Ok(state) => {
                    info!(
                        records = state.records.len(),
                        last_update_ts = state.last_update_ts,
                        "Loaded checkpoint"
                    );
                    self.state = state;
                    Ok(true)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to parse checkpoint JSON, starting fresh");
                    self.state = CheckpointState::default();
                    Ok(false)
                }
            },
            Err(e) if e.is_not_found() => {
                debug!("No checkpoint found, starting fresh");
                Ok(false)
            }
            Err(source) => Err(CheckpointError::CheckpointStorage { source }),
        }
    }

    /// Replace the tracked records and persist them.
    pub async fn save<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a UploadRecord>,
    ) -> Result<(), CheckpointError> {
        self.state.records = records.into_iter().cloned().collect();
        self.state.last_update_ts = chrono::Utc::now().timestamp();

        let json = serde_json::to_vec_pretty(&self.state).context(CheckpointSerializeSnafu)?;
        self.storage
            .atomic_write(&Self::checkpoint_path(), json)
            .await
            .context(CheckpointStorageSnafu)?;

        emit!(CheckpointSaved);
        debug!(records = self.state.records.len(), "Saved checkpoint");
        Ok(())
    }

    /// Take the records of the last loaded checkpoint.
    pub fn take_records(&mut self) -> Vec<UploadRecord> {
        std::mem::take(&mut self.state.records)
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }
}
