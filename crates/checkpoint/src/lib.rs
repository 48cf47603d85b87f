//! Checkpoint management for extdb-sync
//!
//! A checkpoint records, per `(tenancy, mapping)`, the highest sequence
//! number whose effect is durably applied to one target. Checkpoints live
//! inside the target they describe, so every target sink is also a
//! [`CheckpointStore`].
//!
//! ## Storage Backends
//!
//! - `postgres-sink` - `_stack_sync_metadata` table, written in the batch transaction
//! - `clickhouse-sink` - `_stack_sync_metadata` replacing table, read with `max()`
//! - [`MemoryStore`] - process-local map, used by tests and dry runs
//!
//! Checkpoints only ever move forward: [`advance`] is applied by every
//! backend when a write would go backwards.

mod memory;
pub mod store;


pub use memory::MemoryStore;
pub use store::{CheckpointID, CheckpointStore, SyncCheckpoint};

use sync_core::{SequenceId, NO_SEQUENCE};

/// Checkpoint value of a `(tenancy, mapping)` that has never been synced.
pub const NO_CHECKPOINT: SequenceId = NO_SEQUENCE;

/// Name of the checkpoint table every target carries.
pub const METADATA_TABLE: &str = "_stack_sync_metadata";

/// Monotonic checkpoint advancement.
pub fn advance(current: SequenceId, candidate: SequenceId) -> SequenceId {
    current.max(candidate)
}

/// Read the last synced sequence id, defaulting to [`NO_CHECKPOINT`].
pub async fn last_synced<S: CheckpointStore + ?Sized>(
    store: &S,
    id: &CheckpointID,
) -> anyhow::Result<SequenceId> {
    Ok(store
        .read_checkpoint(id)
        .await?
        .map(|c| c.last_synced_sequence_id)
        .unwrap_or(NO_CHECKPOINT))
}
