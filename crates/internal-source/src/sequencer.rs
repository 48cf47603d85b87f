//! Sequence number assignment.
//!
//! Each tracked table is processed in its own transaction:
//!
//! 1. lock up to `batch_size` marked rows with `FOR UPDATE SKIP LOCKED`
//! 2. group them by `(tenancy, mapping)` in a fixed order
//! 3. reserve a contiguous range from each group's counter row
//! 4. stamp the rows and clear their mark
//!
//! The counter row lock is held until commit. A concurrent pass reserving
//! from the same counter waits for that commit, so numbers become visible
//! in ascending order.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use sync_core::{MappingName, SequenceId};
use tokio_postgres::Transaction;
use uuid::Uuid;

use crate::schema::{
    mapping_for_table, source_table, CONTACT_CHANNELS_TABLE, COUNTER_TABLE, TOMBSTONE_TABLE,
    USERS_TABLE,
};
use crate::source::{SequenceAssigner, SequencerPass};
use crate::InternalStore;

/// A locked row waiting for its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRow {
    pub tenancy_id: Uuid,
    pub mapping: MappingName,
    /// Row key: the entity id for live rows, the tombstone id otherwise.
    pub key: Uuid,
}

/// Rows of one `(tenancy, mapping)` counter, in assignment order.
pub type AssignmentGroup = ((Uuid, MappingName), Vec<Uuid>);

/// Group pending rows by counter.
///
/// Groups come out sorted by `(tenancy, mapping)` so that concurrent passes
/// lock counter rows in the same order. Within a group the selection order
/// is kept.
pub fn plan_assignments(rows: impl IntoIterator<Item = PendingRow>) -> Vec<AssignmentGroup> {
    let mut groups: BTreeMap<(Uuid, MappingName), Vec<Uuid>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.tenancy_id, row.mapping))
            .or_default()
            .push(row.key);
    }
    groups.into_iter().collect()
}

/// Numbers reserved by bumping a counter by `count` to `last_value`.
pub fn reserved_range(last_value: SequenceId, count: usize) -> RangeInclusive<SequenceId> {
    (last_value - count as SequenceId + 1)..=last_value
}

const RESERVE_SQL: &str = "INSERT INTO sync_sequence_counters (tenancy_id, mapping_name, last_value) VALUES ($1, $2, $3) ON CONFLICT (tenancy_id, mapping_name) DO UPDATE SET last_value = sync_sequence_counters.last_value + EXCLUDED.last_value RETURNING last_value";

const TOMBSTONE_SELECT_SQL: &str = "SELECT tenancy_id, table_name, id FROM deleted_rows WHERE should_update_sequence_id ORDER BY deleted_at, id LIMIT $1 FOR UPDATE SKIP LOCKED";

const TOMBSTONE_STAMP_SQL: &str = "UPDATE deleted_rows AS t SET sequence_id = v.seq, should_update_sequence_id = FALSE FROM unnest($1::uuid[], $2::bigint[]) AS v(id, seq) WHERE t.id = v.id";

fn live_select_sql(table: &str) -> String {
    format!(
        "SELECT tenancy_id, id FROM {table} WHERE should_update_sequence_id ORDER BY updated_at, id LIMIT $1 FOR UPDATE SKIP LOCKED"
    )
}

fn live_stamp_sql(table: &str) -> String {
    format!(
        "UPDATE {table} AS t SET sequence_id = v.seq, should_update_sequence_id = FALSE FROM unnest($2::uuid[], $3::bigint[]) AS v(id, seq) WHERE t.tenancy_id = $1 AND t.id = v.id"
    )
}

async fn reserve(
    tx: &Transaction<'_>,
    tenancy_id: Uuid,
    mapping: MappingName,
    count: usize,
) -> Result<RangeInclusive<SequenceId>> {
    let row = tx
        .query_one(
            RESERVE_SQL,
            &[&tenancy_id, &mapping.as_str(), &(count as SequenceId)],
        )
        .await
        .with_context(|| format!("Failed to reserve from {COUNTER_TABLE}"))?;
    Ok(reserved_range(row.get(0), count))
}

impl InternalStore {
    async fn sequence_live_table(&self, mapping: MappingName, batch_size: usize) -> Result<SequencerPass> {
        let table = source_table(mapping);
        let mut client = self.client().await?.write().await;
        let tx = client.transaction().await?;

        let rows = tx
            .query(live_select_sql(table).as_str(), &[&(batch_size as i64)])
            .await
            .with_context(|| format!("Failed to select pending rows of {table}"))?;
        let pending = rows.iter().map(|row| PendingRow {
            tenancy_id: row.get(0),
            mapping,
            key: row.get(1),
        });

        let mut pass = SequencerPass::default();
        let stamp = live_stamp_sql(table);
        for ((tenancy_id, mapping), keys) in plan_assignments(pending) {
            let numbers: Vec<SequenceId> = reserve(&tx, tenancy_id, mapping, keys.len()).await?.collect();
            tx.execute(stamp.as_str(), &[&tenancy_id, &keys, &numbers])
                .await
                .with_context(|| format!("Failed to stamp rows of {table}"))?;
            pass.record(tenancy_id, mapping, keys.len() as u64);
        }

        tx.commit().await?;
        Ok(pass)
    }

    async fn sequence_tombstones(&self, batch_size: usize) -> Result<SequencerPass> {
        let mut client = self.client().await?.write().await;
        let tx = client.transaction().await?;

        let rows = tx
            .query(TOMBSTONE_SELECT_SQL, &[&(batch_size as i64)])
            .await
            .with_context(|| format!("Failed to select pending rows of {TOMBSTONE_TABLE}"))?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            let table: String = row.get(1);
            match mapping_for_table(&table) {
                Some(mapping) => pending.push(PendingRow {
                    tenancy_id: row.get(0),
                    mapping,
                    key: row.get(2),
                }),
                None => debug!("Ignoring tombstone of untracked table {table}"),
            }
        }

        let mut pass = SequencerPass::default();
        for ((tenancy_id, mapping), keys) in plan_assignments(pending) {
            let numbers: Vec<SequenceId> = reserve(&tx, tenancy_id, mapping, keys.len()).await?.collect();
            tx.execute(TOMBSTONE_STAMP_SQL, &[&keys, &numbers])
                .await
                .with_context(|| format!("Failed to stamp rows of {TOMBSTONE_TABLE}"))?;
            pass.record(tenancy_id, mapping, keys.len() as u64);
        }

        tx.commit().await?;
        Ok(pass)
    }
}

#[async_trait]
impl SequenceAssigner for InternalStore {
    async fn assign_pending(&self, batch_size: usize) -> Result<SequencerPass> {
        let mut pass = SequencerPass::default();
        // Live rows first: a row updated and then deleted within one pass
        // gets its tombstone numbered last.
        pass.merge(self.sequence_live_table(MappingName::Users, batch_size).await?);
        pass.merge(
            self.sequence_live_table(MappingName::ContactChannels, batch_size)
                .await?,
        );
        pass.merge(self.sequence_tombstones(batch_size).await?);

        debug!(
            "Sequencer pass over {USERS_TABLE}, {CONTACT_CHANNELS_TABLE} and {TOMBSTONE_TABLE} assigned {} numbers",
            pass.total()
        );
        Ok(pass)
    }
}
