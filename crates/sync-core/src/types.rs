//! Identity and wire types of the change stream.
//!
//! Sequence numbers are scoped per `(tenancy, mapping)`. The lowest value a
//! reader can hold is [`NO_SEQUENCE`]; the first assigned number is `1`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Sequence number assigned by the sequencer at commit time.
pub type SequenceId = i64;

/// Watermark of a mapping that has never been synced.
pub const NO_SEQUENCE: SequenceId = -1;

/// Error type for mapping name parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    #[error("Unknown mapping: '{0}' (expected one of: users, contact_channels)")]
    Unknown(String),
}

/// A replicated projection of the internal store.
///
/// Each mapping has exactly one fixed projection and lands in one table of
/// the same name on every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingName {
    Users,
    ContactChannels,
}

impl MappingName {
    /// Every mapping, in the order the poller walks them.
    pub const ALL: [MappingName; 2] = [MappingName::Users, MappingName::ContactChannels];

    pub fn as_str(&self) -> &'static str {
        match self {
            MappingName::Users => "users",
            MappingName::ContactChannels => "contact_channels",
        }
    }

    /// Name of the projection table on the target side.
    pub fn table_name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for MappingName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingName {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "users" => Ok(MappingName::Users),
            "contact_channels" => Ok(MappingName::ContactChannels),
            other => Err(MappingError::Unknown(other.to_string())),
        }
    }
}

/// Operation carried by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// The entity existed when the mutation committed.
    Upsert,
    /// The entity was removed; backed by a tombstone.
    Delete,
}

/// One sequenced mutation of a tracked entity.
///
/// Identity is `(tenancy_id, mapping, sequence_id)`. Records are immutable
/// once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub tenancy_id: Uuid,
    pub mapping: MappingName,
    pub sequence_id: SequenceId,
    pub entity_id: Uuid,
    pub op: ChangeOp,
    pub observed_at: DateTime<Utc>,
}

/// Kind of an external target database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    #[serde(rename = "postgres")]
    Postgres,
    #[serde(rename = "clickhouse")]
    ClickHouse,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Postgres => "postgres",
            TargetKind::ClickHouse => "clickhouse",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a project's `dbSync.externalDatabases` map.
///
/// `connection_string` is absent for platform-managed targets, whose
/// connection is supplied by the deployment instead of the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDatabaseConfig {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    #[serde(
        rename = "connectionString",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub connection_string: Option<String>,
}

/// Column types used by the fixed projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Uuid,
    Text,
    Bool,
    BigInt,
    Timestamp,
}

/// Trait for deriving a target's DDL type from a [`ColumnType`].
pub trait ToDdl {
    /// Generate DDL type definition for the given column type.
    fn to_ddl(&self, column_type: ColumnType) -> String;
}
