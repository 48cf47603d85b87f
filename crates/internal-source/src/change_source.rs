//! Change stream reads over committed internal state.
//!
//! A mapping's stream is the union of its live rows (`upsert`) and its
//! tombstones (`delete`), both filtered to stamped sequence numbers. Every
//! query runs as its own read-committed statement, so rows of uncommitted
//! transactions are never returned.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use sync_core::{
    ChangeOp, ChangeRecord, ContactChannelProjection, MappingName, ProjectedRow, SequenceId,
    UserProjection,
};
use uuid::Uuid;

use crate::schema::source_table;
use crate::source::ChangeSource;
use crate::InternalStore;

fn changes_sql(table: &str) -> String {
    format!(
        "SELECT entity_id, sequence_id, is_deleted, observed_at FROM (
            SELECT id AS entity_id, sequence_id, FALSE AS is_deleted, updated_at AS observed_at
            FROM {table}
            WHERE tenancy_id = $1 AND sequence_id > $2
            UNION ALL
            SELECT entity_id, sequence_id, TRUE AS is_deleted, deleted_at AS observed_at
            FROM deleted_rows
            WHERE tenancy_id = $1 AND table_name = '{table}' AND sequence_id > $2
        ) AS changes
        ORDER BY sequence_id ASC
        LIMIT $3"
    )
}

/// Users flattened to their primary email channel.
const MATERIALIZE_USERS_SQL: &str = "
    SELECT u.id, pc.value, pc.is_verified, u.display_name, u.profile_image_url,
           u.is_anonymous, u.created_at, COALESCE(u.sequence_id, -1)
    FROM project_users u
    LEFT JOIN LATERAL (
        SELECT c.value, c.is_verified
        FROM contact_channels c
        WHERE c.tenancy_id = u.tenancy_id AND c.user_id = u.id
          AND c.channel_type = 'email' AND c.is_primary
        ORDER BY c.created_at, c.id
        LIMIT 1
    ) pc ON TRUE
    WHERE u.tenancy_id = $1 AND u.id = ANY($2)";

const MATERIALIZE_CONTACT_CHANNELS_SQL: &str = "
    SELECT id, user_id, channel_type, value, is_primary, is_verified, created_at,
           COALESCE(sequence_id, -1)
    FROM contact_channels
    WHERE tenancy_id = $1 AND id = ANY($2)";

const PRUNE_TOMBSTONES_SQL: &str = "DELETE FROM deleted_rows
    WHERE tenancy_id = $1 AND table_name = $2 AND sequence_id IS NOT NULL AND sequence_id <= $3";

const MAX_SEQUENCE_SQL: &str =
    "SELECT last_value FROM sync_sequence_counters WHERE tenancy_id = $1 AND mapping_name = $2";

#[async_trait]
impl ChangeSource for InternalStore {
    async fn fetch_changes(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let client = self.client().await?.read().await;
        let rows = client
            .query(
                changes_sql(source_table(mapping)).as_str(),
                &[&tenancy_id, &after, &(limit as i64)],
            )
            .await
            .with_context(|| format!("Failed to fetch changes of mapping '{mapping}'"))?;

        Ok(rows
            .iter()
            .map(|row| {
                let is_deleted: bool = row.get(2);
                let observed_at: DateTime<Utc> = row.get(3);
                ChangeRecord {
                    tenancy_id,
                    mapping,
                    sequence_id: row.get(1),
                    entity_id: row.get(0),
                    op: if is_deleted {
                        ChangeOp::Delete
                    } else {
                        ChangeOp::Upsert
                    },
                    observed_at,
                }
            })
            .collect())
    }

    async fn materialize(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        entity_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ProjectedRow>> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = entity_ids.to_vec();
        let client = self.client().await?.read().await;

        let rows = match mapping {
            MappingName::Users => client.query(MATERIALIZE_USERS_SQL, &[&tenancy_id, &ids]).await,
            MappingName::ContactChannels => {
                client
                    .query(MATERIALIZE_CONTACT_CHANNELS_SQL, &[&tenancy_id, &ids])
                    .await
            }
        }
        .with_context(|| format!("Failed to materialize mapping '{mapping}'"))?;

        let mut current = HashMap::with_capacity(rows.len());
        for row in rows {
            let projected = match mapping {
                MappingName::Users => ProjectedRow::User(UserProjection {
                    id: row.get(0),
                    primary_email: row.get(1),
                    primary_email_verified: row.get(2),
                    display_name: row.get(3),
                    profile_image_url: row.get(4),
                    is_anonymous: row.get(5),
                    signed_up_at: row.get(6),
                    sequence_id: row.get(7),
                }),
                MappingName::ContactChannels => ProjectedRow::ContactChannel(ContactChannelProjection {
                    id: row.get(0),
                    user_id: row.get(1),
                    channel_type: row.get(2),
                    value: row.get(3),
                    is_primary: row.get(4),
                    is_verified: row.get(5),
                    created_at: row.get(6),
                    sequence_id: row.get(7),
                }),
            };
            current.insert(projected.entity_id(), projected);
        }
        Ok(current)
    }

    async fn max_sequence_id(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
    ) -> Result<Option<SequenceId>> {
        let client = self.client().await?.read().await;
        let row = client
            .query_opt(MAX_SEQUENCE_SQL, &[&tenancy_id, &mapping.as_str()])
            .await
            .with_context(|| format!("Failed to read sequence counter of mapping '{mapping}'"))?;
        // A counter at zero has reserved nothing yet.
        Ok(row.map(|r| r.get::<_, SequenceId>(0)).filter(|v| *v > 0))
    }

    async fn prune_tombstones(
        &self,
        tenancy_id: Uuid,
        mapping: MappingName,
        up_to: SequenceId,
    ) -> Result<u64> {
        let client = self.client().await?.read().await;
        let pruned = client
            .execute(
                PRUNE_TOMBSTONES_SQL,
                &[&tenancy_id, &source_table(mapping), &up_to],
            )
            .await
            .with_context(|| format!("Failed to prune tombstones of mapping '{mapping}'"))?;
        if pruned > 0 {
            debug!(
                "Pruned {pruned} tombstones of tenancy {tenancy_id} mapping {mapping} up to {up_to}"
            );
        }
        Ok(pruned)
    }
}
