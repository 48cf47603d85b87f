//! ClickHouse target sink for extdb-sync
//!
//! ClickHouse has no transactional row updates, so every upsert and delete
//! is appended as a versioned row of a `ReplacingMergeTree` keyed by
//! `(tenancy_id, id)`. Deletes are tombstone versions (`is_deleted = 1`).
//! Consumers read the latest state through the `<table>_current` views,
//! which wrap `FINAL`:
//!
//! ```sql
//! SELECT * FROM users_current WHERE tenancy_id = {tenancy:UUID}
//! ```
//!
//! Checkpoints live in `_stack_sync_metadata`, also a replacing table, and
//! are read back with `max(last_synced_sequence_id)` so concurrent writers
//! converge on the highest value.

pub mod config;
pub mod ddl;
mod rows;
mod sink;

pub use config::{parse_connection_string, ClickHouseTarget, ConnectionError};
pub use ddl::ClickHouseDdl;
pub use sink::ClickHouseSink;
