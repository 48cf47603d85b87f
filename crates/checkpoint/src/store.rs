//! Checkpoint storage trait and types
//!
//! This module defines the CheckpointStore trait implemented by every
//! target sink, plus shared types.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::{MappingName, SequenceId};
use uuid::Uuid;

/// Checkpoint identifier for storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointID {
    /// Tenancy whose changes the checkpoint tracks
    pub tenancy_id: Uuid,
    /// Mapping the checkpoint belongs to
    pub mapping: MappingName,
}

impl CheckpointID {
    pub fn new(tenancy_id: Uuid, mapping: MappingName) -> Self {
        Self {
            tenancy_id,
            mapping,
        }
    }
}

/// Checkpoint data stored in a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub tenancy_id: Uuid,
    pub mapping: MappingName,
    /// Highest sequence number durably applied to the target
    pub last_synced_sequence_id: SequenceId,
    /// Timestamp of the last advancement
    pub updated_at: DateTime<Utc>,
}

/// Trait for checkpoint storage operations.
///
/// Implementations must keep the stored value monotonically
/// non-decreasing: a write lower than the stored value is a no-op.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read a checkpoint from the storage backend.
    ///
    /// Returns None if the checkpoint doesn't exist.
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<SyncCheckpoint>>;

    /// Advance a checkpoint to `sequence_id`.
    async fn write_checkpoint(&self, id: &CheckpointID, sequence_id: SequenceId) -> Result<()>;
}
