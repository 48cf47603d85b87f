//! Traits over the internal store.
//!
//! The engine only talks to the internal store through these traits, so the
//! sequencer and poller run unchanged against the PostgreSQL implementation
//! or an in-memory one.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sync_core::{ChangeRecord, MappingName, ProjectedRow, SequenceId};
use uuid::Uuid;

/// Outcome of one sequencer pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequencerPass {
    /// Numbers handed out per mapping.
    pub assigned: BTreeMap<MappingName, u64>,
    /// Tenancies that received new numbers.
    pub tenancies: BTreeSet<Uuid>,
}

impl SequencerPass {
    pub fn total(&self) -> u64 {
        self.assigned.values().sum()
    }

    pub fn record(&mut self, tenancy_id: Uuid, mapping: MappingName, count: u64) {
        if count == 0 {
            return;
        }
        *self.assigned.entry(mapping).or_default() += count;
        self.tenancies.insert(tenancy_id);
    }

    pub fn merge(&mut self, other: SequencerPass) {
        for (mapping, count) in other.assigned {
            *self.assigned.entry(mapping).or_default() += count;
        }
        self.tenancies.extend(other.tenancies);
    }
}

/// Stamps committed, not yet sequenced mutations with sequence numbers.
#[async_trait]
pub trait SequenceAssigner: Send + Sync {
    /// Assign numbers to at most `batch_size` pending rows per tracked table.
    ///
    /// Rows locked by in-flight transactions are skipped and picked up by a
    /// later pass. Running passes concurrently is safe.
    async fn assign_pending(&self, batch_size: usize) -> Result<SequencerPass>;
}

/// Committed-state view of the change stream.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Change records with `sequence_id > after`, ascending, at most `limit`.
    async fn fetch_changes(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>>;

    /// Current state of the given entities; absent entities are omitted.
    async fn materialize(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        entity_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ProjectedRow>>;

    /// Highest committed sequence number of a mapping, if any.
    async fn max_sequence_id(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
    ) -> Result<Option<SequenceId>>;

    /// Drop tombstones with `sequence_id <= up_to`. Only call this with a
    /// number every target of the tenancy has checkpointed past.
    async fn prune_tombstones(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        up_to: SequenceId,
    ) -> Result<u64>;
}

/// A tenancy and its raw `dbSync.externalDatabases` configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenancyRecord {
    pub id: Uuid,
    pub project_id: String,
    pub external_databases: serde_json::Value,
}

/// Read/write access to tenancies and their sync configuration.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list_tenancies(&self) -> Result<Vec<TenancyRecord>>;

    async fn get_tenancy(&self, tenancy_id: Uuid) -> Result<Option<TenancyRecord>>;

    /// Replace the stored `externalDatabases` map of a tenancy if it still
    /// equals `expected`. Returns `false` when another writer got there
    /// first and nothing was changed.
    async fn replace_external_databases(
        &self,
        tenancy_id: Uuid,
        expected: &serde_json::Value,
        external_databases: serde_json::Value,
    ) -> Result<bool>;
}
