//! Column layouts of the fixed projections.
//!
//! Every target derives its DDL and its write statements from these
//! definitions, so the column order here is the column order on the wire.

use crate::types::{ColumnType, MappingName};

/// Single column of a projection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDefinition {
    const fn required(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
        }
    }

    const fn nullable(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: true,
        }
    }
}

/// Projection table definition: primary key `id`, version column `sequence_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingDefinition {
    pub mapping: MappingName,
    pub columns: &'static [ColumnDefinition],
}

/// Name of the entity key column of every projection.
pub const PRIMARY_KEY: &str = "id";

/// Name of the version column of every projection.
pub const VERSION_COLUMN: &str = "sequence_id";

const USERS_COLUMNS: &[ColumnDefinition] = &[
    ColumnDefinition::required("id", ColumnType::Uuid),
    ColumnDefinition::nullable("primary_email", ColumnType::Text),
    ColumnDefinition::nullable("primary_email_verified", ColumnType::Bool),
    ColumnDefinition::nullable("display_name", ColumnType::Text),
    ColumnDefinition::nullable("profile_image_url", ColumnType::Text),
    ColumnDefinition::required("is_anonymous", ColumnType::Bool),
    ColumnDefinition::required("signed_up_at", ColumnType::Timestamp),
    ColumnDefinition::required("sequence_id", ColumnType::BigInt),
];

const CONTACT_CHANNELS_COLUMNS: &[ColumnDefinition] = &[
    ColumnDefinition::required("id", ColumnType::Uuid),
    ColumnDefinition::required("user_id", ColumnType::Uuid),
    ColumnDefinition::required("channel_type", ColumnType::Text),
    ColumnDefinition::required("value", ColumnType::Text),
    ColumnDefinition::required("is_primary", ColumnType::Bool),
    ColumnDefinition::required("is_verified", ColumnType::Bool),
    ColumnDefinition::required("created_at", ColumnType::Timestamp),
    ColumnDefinition::required("sequence_id", ColumnType::BigInt),
];

static USERS: MappingDefinition = MappingDefinition {
    mapping: MappingName::Users,
    columns: USERS_COLUMNS,
};

static CONTACT_CHANNELS: MappingDefinition = MappingDefinition {
    mapping: MappingName::ContactChannels,
    columns: CONTACT_CHANNELS_COLUMNS,
};

impl MappingDefinition {
    /// Look up the definition of a mapping.
    pub fn of(mapping: MappingName) -> &'static MappingDefinition {
        match mapping {
            MappingName::Users => &USERS,
            MappingName::ContactChannels => &CONTACT_CHANNELS,
        }
    }

    pub fn table_name(&self) -> &'static str {
        self.mapping.table_name()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    /// Columns overwritten by an upsert (everything except the key).
    pub fn update_columns(&self) -> impl Iterator<Item = &'static ColumnDefinition> + '_ {
        self.columns.iter().filter(|c| c.name != PRIMARY_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_mapping_has_key_and_version() {
        for mapping in MappingName::ALL {
            let def = MappingDefinition::of(mapping);
            assert_eq!(def.mapping, mapping);
            assert_eq!(def.columns[0].name, PRIMARY_KEY);
            assert!(!def.columns[0].nullable);
            assert!(def.column_names().any(|c| c == VERSION_COLUMN));
        }
    }

    #[test]
    fn test_update_columns_exclude_key() {
        let def = MappingDefinition::of(MappingName::Users);
        let updates: Vec<_> = def.update_columns().map(|c| c.name).collect();
        assert!(!updates.contains(&"id"));
        assert_eq!(updates.len(), def.columns.len() - 1);
    }

    #[test]
    fn test_users_projection_is_flat() {
        // Contact channels are flattened to the primary email only.
        let def = MappingDefinition::of(MappingName::Users);
        let names: Vec<_> = def.column_names().collect();
        assert!(names.contains(&"primary_email"));
        assert!(!names.iter().any(|n| n.contains("channels")));
    }
}
