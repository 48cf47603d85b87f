//! Target sink trait abstraction.
//!
//! This crate defines the `TargetSink` trait that abstracts over external
//! database kinds. Both `postgres-sink` and `clickhouse-sink` implement this
//! trait, allowing the poller to drive every target through one contract.
//!
//! The trait uses sync-core types (ChangeBatch, ProjectedRow, EntityDelete)
//! to avoid coupling to a specific database client.

mod traits;

pub use traits::{ApplyStats, TargetSink};
