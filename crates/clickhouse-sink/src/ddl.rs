//! ClickHouse DDL generation from sync-core mapping definitions.

use checkpoint::METADATA_TABLE;
use sync_core::{ColumnType, MappingDefinition, ToDdl, PRIMARY_KEY, VERSION_COLUMN};

/// Tenancy column prepended to every ClickHouse table.
pub const TENANCY_COLUMN: &str = "tenancy_id";

/// Tombstone flag column of every projection table.
pub const DELETED_COLUMN: &str = "is_deleted";

/// ClickHouse DDL generator.
pub struct ClickHouseDdl;

impl ToDdl for ClickHouseDdl {
    fn to_ddl(&self, column_type: ColumnType) -> String {
        match column_type {
            ColumnType::Uuid => "UUID".to_string(),
            ColumnType::Text => "String".to_string(),
            ColumnType::Bool => "Bool".to_string(),
            ColumnType::BigInt => "Int64".to_string(),
            ColumnType::Timestamp => "DateTime64(3, 'UTC')".to_string(),
        }
    }
}

fn quote(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "\\`"))
}

impl ClickHouseDdl {
    pub fn create_database(&self, database: &str) -> String {
        format!("CREATE DATABASE IF NOT EXISTS {}", quote(database))
    }

    /// Projection table resolving to the highest `sequence_id` per entity.
    pub fn create_table(&self, def: &MappingDefinition) -> String {
        let mut column_defs = vec![format!("  {} UUID", quote(TENANCY_COLUMN))];
        column_defs.extend(def.columns.iter().map(|c| {
            let ty = self.to_ddl(c.column_type);
            let ty = if c.nullable { format!("Nullable({ty})") } else { ty };
            format!("  {} {}", quote(c.name), ty)
        }));
        column_defs.push(format!("  {} UInt8 DEFAULT 0", quote(DELETED_COLUMN)));

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n) ENGINE = ReplacingMergeTree({}, {}) ORDER BY ({}, {})",
            quote(def.table_name()),
            column_defs.join(",\n"),
            quote(VERSION_COLUMN),
            quote(DELETED_COLUMN),
            quote(TENANCY_COLUMN),
            quote(PRIMARY_KEY),
        )
    }

    /// Name of the read-side view over a projection table.
    pub fn current_view_name(def: &MappingDefinition) -> String {
        format!("{}_current", def.table_name())
    }

    /// Read-side view showing only the latest live version of each entity.
    pub fn create_current_view(&self, def: &MappingDefinition) -> String {
        let columns: Vec<String> = std::iter::once(TENANCY_COLUMN)
            .chain(def.columns.iter().map(|c| c.name))
            .map(quote)
            .collect();
        format!(
            "CREATE VIEW IF NOT EXISTS {} AS SELECT {} FROM {} FINAL WHERE {} = 0",
            quote(&Self::current_view_name(def)),
            columns.join(", "),
            quote(def.table_name()),
            quote(DELETED_COLUMN),
        )
    }

    pub fn create_metadata_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  `tenancy_id` UUID,\n  `mapping_name` String,\n  `last_synced_sequence_id` Int64,\n  `updated_at` DateTime64(3, 'UTC')\n) ENGINE = ReplacingMergeTree(`last_synced_sequence_id`) ORDER BY (`tenancy_id`, `mapping_name`)",
            quote(METADATA_TABLE)
        )
    }

    pub fn read_checkpoint(&self) -> String {
        format!(
            "SELECT count() AS entries, max(`last_synced_sequence_id`) AS last_synced_sequence_id, max(`updated_at`) AS updated_at FROM {} WHERE `tenancy_id` = toUUID(?) AND `mapping_name` = ?",
            quote(METADATA_TABLE)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::MappingName;

    #[test]
    fn test_create_table_replacing_engine() {
        let sql = ClickHouseDdl.create_table(MappingDefinition::of(MappingName::Users));
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `users`"));
        assert!(sql.contains("`tenancy_id` UUID"));
        assert!(sql.contains("`primary_email` Nullable(String)"));
        assert!(sql.contains("`signed_up_at` DateTime64(3, 'UTC')"));
        assert!(sql.contains("`is_deleted` UInt8 DEFAULT 0"));
        assert!(sql.ends_with(
            "ENGINE = ReplacingMergeTree(`sequence_id`, `is_deleted`) ORDER BY (`tenancy_id`, `id`)"
        ));
    }

    #[test]
    fn test_current_view_hides_superseded_and_deleted_rows() {
        let def = MappingDefinition::of(MappingName::ContactChannels);
        let sql = ClickHouseDdl.create_current_view(def);
        assert!(sql.starts_with("CREATE VIEW IF NOT EXISTS `contact_channels_current` AS SELECT `tenancy_id`, `id`,"));
        assert!(sql.ends_with("FROM `contact_channels` FINAL WHERE `is_deleted` = 0"));
        assert!(!sql.contains("SELECT *"));
    }

    #[test]
    fn test_metadata_table_keeps_highest_checkpoint() {
        let sql = ClickHouseDdl.create_metadata_table();
        assert!(sql.contains("`_stack_sync_metadata`"));
        assert!(sql.contains("ReplacingMergeTree(`last_synced_sequence_id`)"));
        assert!(ClickHouseDdl.read_checkpoint().contains("max(`last_synced_sequence_id`)"));
    }
}
