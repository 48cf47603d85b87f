//! TargetSink trait definition.
//!
//! Each target kind has different write semantics: Postgres applies a batch
//! and its checkpoint in one transaction, ClickHouse appends versioned rows
//! and resolves the latest version at read time. The poller only sees the
//! contract below.

use anyhow::Result;
use checkpoint::CheckpointStore;
use serde::Serialize;
use sync_core::{ChangeBatch, MappingName, SequenceId, TargetKind};
use uuid::Uuid;

/// Outcome of one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    pub upserted: usize,
    pub deleted: usize,
    /// Checkpoint value after the batch.
    pub checkpoint: SequenceId,
}

/// Trait for applying change batches to an external target.
///
/// # Usage Pattern
///
/// The poller holds one boxed sink per resolved target:
///
/// ```ignore
/// let sink = connector.connect(&target).await?;
/// sink.provision(&MappingName::ALL).await?;
/// let after = checkpoint::last_synced(&*sink, &id).await?;
/// // ... fetch and compact a page ...
/// sink.apply_batch(tenancy_id, &batch).await?;
/// ```
///
/// Implementations are idempotent: replaying an applied batch leaves the
/// target unchanged, and rows are only overwritten or removed by changes
/// carrying an equal or higher sequence number.
#[async_trait::async_trait]
pub trait TargetSink: CheckpointStore {
    /// Kind of the underlying database.
    fn kind(&self) -> TargetKind;

    /// Create projection tables and the checkpoint table if absent.
    ///
    /// Concurrent provisioning of the same target must succeed.
    async fn provision(&self, mappings: &[MappingName]) -> Result<()>;

    /// Apply a compacted batch and advance the mapping's checkpoint to
    /// `batch.high_watermark`.
    ///
    /// Either the whole batch and the checkpoint become visible, or the
    /// checkpoint stays where it was.
    async fn apply_batch(&self, tenancy_id: Uuid, batch: &ChangeBatch) -> Result<ApplyStats>;
}
