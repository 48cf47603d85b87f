use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::source::{TenancyRecord, TenantDirectory};
use crate::InternalStore;

const SELECT_TENANCIES_SQL: &str =
    "SELECT id, project_id, external_databases FROM tenancies ORDER BY created_at, id";

const SELECT_TENANCY_SQL: &str =
    "SELECT id, project_id, external_databases FROM tenancies WHERE id = $1";

const REPLACE_EXTERNAL_DATABASES_SQL: &str =
    "UPDATE tenancies SET external_databases = $3 WHERE id = $1 AND external_databases = $2";

fn tenancy_from_row(row: &Row) -> TenancyRecord {
    TenancyRecord {
        id: row.get(0),
        project_id: row.get(1),
        external_databases: row.get(2),
    }
}

#[async_trait]
impl TenantDirectory for InternalStore {
    async fn list_tenancies(&self) -> Result<Vec<TenancyRecord>> {
        let client = self.client().await?.read().await;
        let rows = client
            .query(SELECT_TENANCIES_SQL, &[])
            .await
            .context("Failed to list tenancies")?;
        Ok(rows.iter().map(tenancy_from_row).collect())
    }

    async fn get_tenancy(&self, tenancy_id: Uuid) -> Result<Option<TenancyRecord>> {
        let client = self.client().await?.read().await;
        let row = client
            .query_opt(SELECT_TENANCY_SQL, &[&tenancy_id])
            .await
            .with_context(|| format!("Failed to load tenancy {tenancy_id}"))?;
        Ok(row.as_ref().map(tenancy_from_row))
    }

    async fn replace_external_databases(
        &self,
        tenancy_id: Uuid,
        expected: &serde_json::Value,
        external_databases: serde_json::Value,
    ) -> Result<bool> {
        let client = self.client().await?.read().await;
        let updated = client
            .execute(
                REPLACE_EXTERNAL_DATABASES_SQL,
                &[&tenancy_id, expected, &external_databases],
            )
            .await
            .with_context(|| format!("Failed to update sync configuration of tenancy {tenancy_id}"))?;
        Ok(updated == 1)
    }
}
