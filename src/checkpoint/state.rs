//! Checkpoint state serialization.

use serde::{Deserialize, Serialize};

use crate::reconciler::UploadRecord;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Uploads that had not reached a terminal state when the checkpoint was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Tracked uploads in submission order.
    #[serde(default)]
    pub records: Vec<UploadRecord>,
    /// Unix timestamp (seconds) of the last save.
    #[serde(default)]
    pub last_update_ts: i64,
}

fn default_schema_version() -> u32 {
    CHECKPOINT_SCHEMA_VERSION
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            records: Vec::new(),
            last_update_ts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_state_default() {
        let state = CheckpointState::default();
        assert_eq!(state.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert!(state.records.is_empty());
    }

    #[test]
    fn test_missing_fields_default() {
        let state: CheckpointState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert!(state.records.is_empty());
        assert_eq!(state.last_update_ts, 0);
    }
}
