//! PostgreSQL target sink for extdb-sync
//!
//! Provisions one projection table per mapping plus the
//! `_stack_sync_metadata` checkpoint table, and applies each change batch
//! together with its checkpoint in a single transaction.

pub mod config;
pub mod ddl;
mod params;
mod sink;

pub use config::{parse_connection_string, ConnectionError};
pub use ddl::PostgresDdl;
pub use sink::PostgresSink;
