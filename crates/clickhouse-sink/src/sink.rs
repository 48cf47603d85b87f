//! Append-and-resolve ClickHouse sink.
//!
//! Rows of a batch are inserted before the checkpoint row. A failure
//! between the two leaves the checkpoint behind, and replaying the batch
//! appends identical versions which the replacing engine collapses.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use checkpoint::{CheckpointID, CheckpointStore, SyncCheckpoint, METADATA_TABLE};
use clickhouse::Client;
use sync_core::{ChangeBatch, MappingDefinition, MappingName, ProjectedRow, SequenceId, TargetKind};
use target_sink::{ApplyStats, TargetSink};
use tracing::debug;
use uuid::Uuid;

use crate::config::{parse_connection_string, ClickHouseTarget, DEFAULT_DATABASE};
use crate::ddl::ClickHouseDdl;
use crate::rows::{CheckpointProbe, ContactChannelRow, MetadataRow, UserRow};

/// Insert a slice of typed rows in one RowBinary request.
macro_rules! insert_rows {
    ($client:expr, $table:expr, $row:ty, $rows:expr) => {{
        let mut insert = $client
            .insert::<$row>($table)
            .await
            .with_context(|| format!("Failed to begin insert into '{}'", $table))?;
        for row in $rows.iter() {
            insert
                .write(row)
                .await
                .with_context(|| format!("Failed to write row into '{}'", $table))?;
        }
        insert
            .end()
            .await
            .with_context(|| format!("Failed to finish insert into '{}'", $table))?;
    }};
}

/// Target sink writing to a ClickHouse database over HTTP.
pub struct ClickHouseSink {
    name: String,
    database: String,
    client: Client,
    /// Same endpoint, bound to the always-present `default` database.
    admin: Client,
}

impl ClickHouseSink {
    /// Build a sink and check the endpoint is reachable.
    pub async fn connect(name: &str, connection_string: &str) -> Result<Self> {
        let target = parse_connection_string(connection_string)?;
        let sink = Self::from_target(name, &target);
        sink.admin
            .query("SELECT 1")
            .execute()
            .await
            .with_context(|| format!("Failed to reach ClickHouse target '{name}'"))?;
        Ok(sink)
    }

    fn from_target(name: &str, target: &ClickHouseTarget) -> Self {
        let mut base = Client::default().with_url(&target.url);
        if let Some(user) = &target.user {
            base = base.with_user(user);
        }
        if let Some(password) = &target.password {
            base = base.with_password(password);
        }

        Self {
            name: name.to_string(),
            database: target.database.clone(),
            client: base.clone().with_database(&target.database),
            admin: base.with_database(DEFAULT_DATABASE),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn insert_checkpoint(&self, id: &CheckpointID, sequence_id: SequenceId) -> Result<()> {
        let row = MetadataRow {
            tenancy_id: id.tenancy_id,
            mapping_name: id.mapping.as_str().to_string(),
            last_synced_sequence_id: sequence_id,
            updated_at: Utc::now(),
        };
        insert_rows!(self.client, METADATA_TABLE, MetadataRow, [row]);
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for ClickHouseSink {
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<SyncCheckpoint>> {
        let probe = self
            .client
            .query(&ClickHouseDdl.read_checkpoint())
            .bind(id.tenancy_id.to_string())
            .bind(id.mapping.as_str())
            .fetch_one::<CheckpointProbe>()
            .await
            .with_context(|| format!("Failed to read checkpoint for mapping '{}'", id.mapping))?;

        if probe.entries == 0 {
            return Ok(None);
        }
        Ok(Some(SyncCheckpoint {
            tenancy_id: id.tenancy_id,
            mapping: id.mapping,
            last_synced_sequence_id: probe.last_synced_sequence_id,
            updated_at: probe.updated_at,
        }))
    }

    async fn write_checkpoint(&self, id: &CheckpointID, sequence_id: SequenceId) -> Result<()> {
        // Lower values are harmless: readers take the maximum.
        self.insert_checkpoint(id, sequence_id).await
    }
}

#[async_trait]
impl TargetSink for ClickHouseSink {
    fn kind(&self) -> TargetKind {
        TargetKind::ClickHouse
    }

    async fn provision(&self, mappings: &[MappingName]) -> Result<()> {
        let ddl = ClickHouseDdl;
        self.admin
            .query(&ddl.create_database(&self.database))
            .execute()
            .await
            .with_context(|| format!("Failed to create database '{}'", self.database))?;

        for mapping in mappings {
            let def = MappingDefinition::of(*mapping);
            self.client
                .query(&ddl.create_table(def))
                .execute()
                .await
                .with_context(|| format!("Failed to provision table '{}'", def.table_name()))?;
            self.client
                .query(&ddl.create_current_view(def))
                .execute()
                .await
                .with_context(|| {
                    format!(
                        "Failed to provision view '{}'",
                        ClickHouseDdl::current_view_name(def)
                    )
                })?;
        }
        self.client
            .query(&ddl.create_metadata_table())
            .execute()
            .await
            .with_context(|| format!("Failed to provision table '{METADATA_TABLE}'"))?;

        debug!(sink = %self.name, database = %self.database, "Provisioned ClickHouse target");
        Ok(())
    }

    async fn apply_batch(&self, tenancy_id: Uuid, batch: &ChangeBatch) -> Result<ApplyStats> {
        let table = batch.mapping.table_name();
        match batch.mapping {
            MappingName::Users => {
                let mut rows = Vec::with_capacity(batch.len());
                for row in &batch.upserts {
                    match row {
                        ProjectedRow::User(user) => rows.push(UserRow::live(tenancy_id, user)),
                        other => anyhow::bail!("Row of mapping '{}' in a users batch", other.mapping()),
                    }
                }
                rows.extend(batch.deletes.iter().map(|d| UserRow::tombstone(tenancy_id, d)));
                if !rows.is_empty() {
                    insert_rows!(self.client, table, UserRow, rows);
                }
            }
            MappingName::ContactChannels => {
                let mut rows = Vec::with_capacity(batch.len());
                for row in &batch.upserts {
                    match row {
                        ProjectedRow::ContactChannel(channel) => {
                            rows.push(ContactChannelRow::live(tenancy_id, channel))
                        }
                        other => anyhow::bail!(
                            "Row of mapping '{}' in a contact_channels batch",
                            other.mapping()
                        ),
                    }
                }
                rows.extend(
                    batch
                        .deletes
                        .iter()
                        .map(|d| ContactChannelRow::tombstone(tenancy_id, d)),
                );
                if !rows.is_empty() {
                    insert_rows!(self.client, table, ContactChannelRow, rows);
                }
            }
        }

        self.insert_checkpoint(&CheckpointID::new(tenancy_id, batch.mapping), batch.high_watermark)
            .await?;

        let stats = ApplyStats {
            upserted: batch.upserts.len(),
            deleted: batch.deletes.len(),
            checkpoint: batch.high_watermark,
        };
        debug!(
            sink = %self.name,
            tenancy_id = %tenancy_id,
            mapping = %batch.mapping,
            upserted = stats.upserted,
            deleted = stats.deleted,
            checkpoint = stats.checkpoint,
            "Applied batch"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_target_keeps_database() {
        let target = parse_connection_string("http://u:p@localhost:8123/analytics").unwrap();
        let sink = ClickHouseSink::from_target("reporting", &target);
        assert_eq!(sink.name(), "reporting");
        assert_eq!(sink.database, "analytics");
        assert_eq!(sink.kind(), TargetKind::ClickHouse);
    }
}
