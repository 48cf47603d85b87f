//! PostgreSQL DDL and DML generation from sync-core mapping definitions.

use checkpoint::METADATA_TABLE;
use sync_core::{ColumnType, MappingDefinition, ToDdl, PRIMARY_KEY, VERSION_COLUMN};

/// PostgreSQL DDL generator.
pub struct PostgresDdl;

impl ToDdl for PostgresDdl {
    fn to_ddl(&self, column_type: ColumnType) -> String {
        match column_type {
            ColumnType::Uuid => "UUID".to_string(),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Bool => "BOOLEAN".to_string(),
            ColumnType::BigInt => "BIGINT".to_string(),
            ColumnType::Timestamp => "TIMESTAMPTZ".to_string(),
        }
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

impl PostgresDdl {
    /// CREATE TABLE for a projection; the key column is the primary key.
    pub fn create_table(&self, def: &MappingDefinition) -> String {
        let column_defs: Vec<String> = def
            .columns
            .iter()
            .map(|c| {
                let constraint = if c.name == PRIMARY_KEY {
                    "PRIMARY KEY"
                } else if c.nullable {
                    "NULL"
                } else {
                    "NOT NULL"
                };
                format!("  {} {} {}", quote(c.name), self.to_ddl(c.column_type), constraint)
            })
            .collect();

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            quote(def.table_name()),
            column_defs.join(",\n")
        )
    }

    /// Readers get SELECT only; writes stay with the sync role.
    pub fn access_grants(&self, def: &MappingDefinition) -> [String; 2] {
        let table = quote(def.table_name());
        [
            format!("REVOKE ALL ON TABLE {table} FROM PUBLIC"),
            format!("GRANT SELECT ON TABLE {table} TO PUBLIC"),
        ]
    }

    pub fn create_metadata_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  \"mapping_name\" TEXT PRIMARY KEY,\n  \"last_synced_sequence_id\" BIGINT NOT NULL DEFAULT -1,\n  \"updated_at\" TIMESTAMPTZ NOT NULL DEFAULT now()\n)",
            quote(METADATA_TABLE)
        )
    }

    /// Multi-row upsert for `rows` rows that only overwrites older versions.
    pub fn upsert(&self, def: &MappingDefinition, rows: usize) -> String {
        let table = quote(def.table_name());
        let width = def.columns.len();
        let columns: Vec<String> = def.column_names().map(quote).collect();
        let values: Vec<String> = (0..rows)
            .map(|r| {
                let placeholders: Vec<String> =
                    (1..=width).map(|c| format!("${}", r * width + c)).collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();
        let updates: Vec<String> = def
            .update_columns()
            .map(|c| format!("{col} = EXCLUDED.{col}", col = quote(c.name)))
            .collect();

        format!(
            "INSERT INTO {table} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {} WHERE {table}.{version} <= EXCLUDED.{version}",
            columns.join(", "),
            values.join(", "),
            quote(PRIMARY_KEY),
            updates.join(", "),
            version = quote(VERSION_COLUMN),
        )
    }

    /// Delete by `(id, version)` pairs; a row newer than its delete survives.
    pub fn delete(&self, def: &MappingDefinition) -> String {
        format!(
            "DELETE FROM {table} AS t USING unnest($1::uuid[], $2::bigint[]) AS d(id, sequence_id) WHERE t.{key} = d.id AND t.{version} <= d.sequence_id",
            table = quote(def.table_name()),
            key = quote(PRIMARY_KEY),
            version = quote(VERSION_COLUMN),
        )
    }

    pub fn write_checkpoint(&self) -> String {
        format!(
            "INSERT INTO {table} (\"mapping_name\", \"last_synced_sequence_id\", \"updated_at\") VALUES ($1, $2, now()) ON CONFLICT (\"mapping_name\") DO UPDATE SET \"last_synced_sequence_id\" = GREATEST({table}.\"last_synced_sequence_id\", EXCLUDED.\"last_synced_sequence_id\"), \"updated_at\" = now()",
            table = quote(METADATA_TABLE)
        )
    }

    pub fn read_checkpoint(&self) -> String {
        format!(
            "SELECT \"last_synced_sequence_id\", \"updated_at\" FROM {} WHERE \"mapping_name\" = $1",
            quote(METADATA_TABLE)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::MappingName;

    #[test]
    fn test_create_table_users() {
        let sql = PostgresDdl.create_table(MappingDefinition::of(MappingName::Users));
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"users\""));
        assert!(sql.contains("\"id\" UUID PRIMARY KEY"));
        assert!(sql.contains("\"primary_email\" TEXT NULL"));
        assert!(sql.contains("\"signed_up_at\" TIMESTAMPTZ NOT NULL"));
        assert!(sql.contains("\"sequence_id\" BIGINT NOT NULL"));
    }

    #[test]
    fn test_upsert_placeholders_and_guard() {
        let def = MappingDefinition::of(MappingName::ContactChannels);
        let sql = PostgresDdl.upsert(def, 2);
        let width = def.columns.len();
        assert!(sql.contains(&format!("${}", 2 * width)));
        assert!(!sql.contains(&format!("${}", 2 * width + 1)));
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
        assert!(!sql.contains("\"id\" = EXCLUDED.\"id\""));
        assert!(sql.ends_with(
            "WHERE \"contact_channels\".\"sequence_id\" <= EXCLUDED.\"sequence_id\""
        ));
    }

    #[test]
    fn test_delete_is_version_guarded() {
        let sql = PostgresDdl.delete(MappingDefinition::of(MappingName::Users));
        assert!(sql.contains("unnest($1::uuid[], $2::bigint[])"));
        assert!(sql.contains("t.\"sequence_id\" <= d.sequence_id"));
    }

    #[test]
    fn test_checkpoint_write_is_monotonic() {
        let sql = PostgresDdl.write_checkpoint();
        assert!(sql.contains("\"_stack_sync_metadata\""));
        assert!(sql.contains("GREATEST("));
    }

    #[test]
    fn test_access_grants_read_only() {
        let grants = PostgresDdl.access_grants(MappingDefinition::of(MappingName::Users));
        assert_eq!(grants[0], "REVOKE ALL ON TABLE \"users\" FROM PUBLIC");
        assert_eq!(grants[1], "GRANT SELECT ON TABLE \"users\" TO PUBLIC");
    }
}
