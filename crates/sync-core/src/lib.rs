//! Core types for the extdb-sync framework.
//!
//! This crate provides the foundational types shared by the internal
//! change source, the sequencer, the poller and every target sink:
//!
//! - [`MappingName`] - The fixed set of replicated projections
//! - [`ChangeRecord`] - One sequenced mutation of a tracked entity
//! - [`ProjectedRow`] - The target-side materialization of an entity
//! - [`ChangeBatch`] - A compacted page of upserts and deletes
//! - [`MappingDefinition`] - Column layout of each projection
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── checkpoint        (checkpoint ids keyed by MappingName)
//!    ├─── target-sink       (sink contract over ChangeBatch)
//!    ├─── postgres-sink     (DDL + writes derived from MappingDefinition)
//!    ├─── clickhouse-sink   (DDL + writes derived from MappingDefinition)
//!    └─── internal-source   (produces ChangeRecord / ProjectedRow)
//! ```

pub mod schema;
pub mod types;
pub mod values;

// Re-exports for convenience
pub use schema::{ColumnDefinition, MappingDefinition, PRIMARY_KEY, VERSION_COLUMN};
pub use types::{
    ChangeOp, ChangeRecord, ColumnType, ExternalDatabaseConfig, MappingError, MappingName,
    SequenceId, TargetKind, ToDdl, NO_SEQUENCE,
};
pub use values::{
    ChangeBatch, ContactChannelProjection, EntityDelete, ProjectedRow, UserProjection,
};
