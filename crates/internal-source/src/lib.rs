//! Trigger-based change capture over the internal multi-tenant store
//!
//! Row-level triggers mark every created or updated `project_users` and
//! `contact_channels` row for sequencing and write a tombstone into
//! `deleted_rows` for every removal. The sequencer later stamps marked rows
//! with per-`(tenancy, mapping)` sequence numbers, and the change source
//! serves them back in ascending order.
//!
//! Sequence numbers come from counter rows in `sync_sequence_counters`. The
//! counter row stays locked until the assigning transaction commits, so a
//! reader never observes a higher number before a lower one.

mod change_source;
mod client;
mod fusebox;
pub mod schema;
mod sequencer;
mod source;
mod tenancy;

pub use client::{new_postgresql_client, InternalStore};
pub use fusebox::FuseboxFlags;
pub use schema::init_source_schema;
pub use sequencer::{plan_assignments, reserved_range, AssignmentGroup, PendingRow};
pub use source::{
    ChangeSource, SequenceAssigner, SequencerPass, TenancyRecord, TenantDirectory,
};

/// Internal store connection options
#[derive(Clone, Debug)]
pub struct SourceOpts {
    /// PostgreSQL connection URI of the internal store
    pub source_uri: String,
}
