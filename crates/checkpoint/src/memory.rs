//! In-memory checkpoint storage implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use sync_core::SequenceId;

use crate::advance;
use crate::store::{CheckpointID, CheckpointStore, SyncCheckpoint};

/// In-memory implementation of CheckpointStore trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    checkpoints: Mutex<HashMap<CheckpointID, SyncCheckpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored checkpoint.
    pub fn all(&self) -> Vec<SyncCheckpoint> {
        match self.checkpoints.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<SyncCheckpoint>> {
        let map = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        Ok(map.get(id).cloned())
    }

    async fn write_checkpoint(&self, id: &CheckpointID, sequence_id: SequenceId) -> Result<()> {
        let mut map = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        let entry = map.entry(*id).or_insert_with(|| SyncCheckpoint {
            tenancy_id: id.tenancy_id,
            mapping: id.mapping,
            last_synced_sequence_id: sequence_id,
            updated_at: Utc::now(),
        });
        entry.last_synced_sequence_id = advance(entry.last_synced_sequence_id, sequence_id);
        entry.updated_at = Utc::now();
        tracing::debug!(
            tenancy_id = %id.tenancy_id,
            mapping = %id.mapping,
            last_synced_sequence_id = entry.last_synced_sequence_id,
            "Stored checkpoint"
        );
        Ok(())
    }
}
