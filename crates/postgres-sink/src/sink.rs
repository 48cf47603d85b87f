//! Transactional PostgreSQL sink.
//!
//! A customer Postgres target belongs to exactly one project, so its
//! checkpoint rows are keyed by mapping name alone.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use checkpoint::{CheckpointID, CheckpointStore, SyncCheckpoint};
use sync_core::{ChangeBatch, MappingDefinition, MappingName, SequenceId, TargetKind};
use target_sink::{ApplyStats, TargetSink};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::parse_connection_string;
use crate::ddl::PostgresDdl;
use crate::params::{as_refs, row_params, Param};

/// Rows per multi-row INSERT, well below the 65535 bind parameter limit.
const MAX_ROWS_PER_STATEMENT: usize = 1000;

/// Target sink writing to a customer-owned PostgreSQL database.
pub struct PostgresSink {
    name: String,
    client: Mutex<Client>,
}

impl PostgresSink {
    /// Connect to a PostgreSQL target.
    pub async fn connect(name: &str, connection_string: &str) -> Result<Self> {
        let config = parse_connection_string(connection_string)?;
        let (client, connection) = config
            .connect(NoTls)
            .await
            .with_context(|| format!("Failed to connect to PostgreSQL target '{name}'"))?;

        let target = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(sink = %target, "PostgreSQL connection error: {e}");
            }
        });

        Ok(Self::from_client(name, client))
    }

    /// Wrap an already connected client.
    pub fn from_client(name: &str, client: Client) -> Self {
        Self {
            name: name.to_string(),
            client: Mutex::new(client),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn execute_ddl(&self, client: &Client, sql: &str, table: &str) -> Result<()> {
        match client.batch_execute(sql).await {
            Ok(()) => Ok(()),
            Err(e) if is_provisioning_race(&e) => {
                // Another poller provisioned the same table concurrently.
                if table_exists(client, table).await? {
                    debug!(sink = %self.name, table, "Table provisioned concurrently");
                    Ok(())
                } else {
                    Err(e).with_context(|| format!("Failed to provision table '{table}'"))
                }
            }
            Err(e) => Err(e).with_context(|| format!("Failed to provision table '{table}'")),
        }
    }
}

/// Errors PostgreSQL raises when two sessions create the same relation or
/// alter the same catalog row at once.
pub(crate) fn is_provisioning_race(e: &tokio_postgres::Error) -> bool {
    match e.as_db_error() {
        Some(db) => {
            (db.code() == &SqlState::UNIQUE_VIOLATION
                && db.constraint() == Some("pg_type_typname_nsp_index"))
                || db.code() == &SqlState::DUPLICATE_TABLE
                || db.message().contains("tuple concurrently updated")
        }
        None => false,
    }
}

async fn table_exists(client: &Client, table: &str) -> Result<bool> {
    let row = client
        .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&table])
        .await?;
    Ok(row.get(0))
}

#[async_trait]
impl CheckpointStore for PostgresSink {
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<SyncCheckpoint>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(PostgresDdl.read_checkpoint().as_str(), &[&id.mapping.as_str()])
            .await
            .with_context(|| format!("Failed to read checkpoint for mapping '{}'", id.mapping))?;

        Ok(row.map(|row| {
            let updated_at: DateTime<Utc> = row.get(1);
            SyncCheckpoint {
                tenancy_id: id.tenancy_id,
                mapping: id.mapping,
                last_synced_sequence_id: row.get(0),
                updated_at,
            }
        }))
    }

    async fn write_checkpoint(&self, id: &CheckpointID, sequence_id: SequenceId) -> Result<()> {
        let client = self.client.lock().await;
        client
            .execute(
                PostgresDdl.write_checkpoint().as_str(),
                &[&id.mapping.as_str(), &sequence_id],
            )
            .await
            .with_context(|| format!("Failed to write checkpoint for mapping '{}'", id.mapping))?;
        Ok(())
    }
}

#[async_trait]
impl TargetSink for PostgresSink {
    fn kind(&self) -> TargetKind {
        TargetKind::Postgres
    }

    async fn provision(&self, mappings: &[MappingName]) -> Result<()> {
        let client = self.client.lock().await;
        let ddl = PostgresDdl;

        for mapping in mappings {
            let def = MappingDefinition::of(*mapping);
            self.execute_ddl(&client, &ddl.create_table(def), def.table_name())
                .await?;
            for grant in ddl.access_grants(def) {
                self.execute_ddl(&client, &grant, def.table_name()).await?;
            }
        }
        self.execute_ddl(&client, &ddl.create_metadata_table(), checkpoint::METADATA_TABLE)
            .await?;

        debug!(sink = %self.name, "Provisioned PostgreSQL target");
        Ok(())
    }

    async fn apply_batch(&self, tenancy_id: Uuid, batch: &ChangeBatch) -> Result<ApplyStats> {
        let def = MappingDefinition::of(batch.mapping);
        if let Some(row) = batch.upserts.iter().find(|r| r.mapping() != batch.mapping) {
            anyhow::bail!(
                "Row of mapping '{}' in a '{}' batch",
                row.mapping(),
                batch.mapping
            );
        }

        let ddl = PostgresDdl;
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin batch transaction")?;

        let mut stats = ApplyStats::default();
        for chunk in batch.upserts.chunks(MAX_ROWS_PER_STATEMENT) {
            let params: Vec<Param> = chunk.iter().flat_map(row_params).collect();
            let affected = tx
                .execute(ddl.upsert(def, chunk.len()).as_str(), &as_refs(&params))
                .await
                .with_context(|| format!("Failed to upsert into '{}'", def.table_name()))?;
            stats.upserted += affected as usize;
        }

        if !batch.deletes.is_empty() {
            let ids: Vec<Uuid> = batch.deletes.iter().map(|d| d.entity_id).collect();
            let versions: Vec<i64> = batch.deletes.iter().map(|d| d.sequence_id).collect();
            let affected = tx
                .execute(ddl.delete(def).as_str(), &[&ids, &versions])
                .await
                .with_context(|| format!("Failed to delete from '{}'", def.table_name()))?;
            stats.deleted = affected as usize;
        }

        tx.execute(
            ddl.write_checkpoint().as_str(),
            &[&batch.mapping.as_str(), &batch.high_watermark],
        )
        .await
        .context("Failed to advance checkpoint")?;

        tx.commit().await.context("Failed to commit batch")?;
        stats.checkpoint = batch.high_watermark;

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
