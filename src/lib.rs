//! extdb-sync Library
//!
//! Change-data-capture engine that mirrors tenant user data from the
//! platform's internal multi-tenant PostgreSQL store into customer-owned
//! external databases.
//!
//! # Features
//!
//! - Commit-ordered sequencing: triggers mark changed rows and the sequencer
//!   stamps them with per-`(tenancy, mapping)` sequence numbers
//! - Polling export: every `(tenancy, target, mapping)` triple replays the
//!   change stream past the checkpoint stored in the target itself
//! - Heterogeneous targets: PostgreSQL (transactional) and ClickHouse
//!   (versioned rows resolved at read time)
//! - Per-target isolation: an unreachable target only leaves itself behind
//! - Fusebox: persisted switches halting the sequencer or the poller
//!
//! # Components
//!
//! - [`registry`] - a project's named targets plus the reserved default target
//! - [`sequencer`] - `run_sequencer` entry point
//! - [`poller`] - `run_poller` / `run_poller_for` entry points
//! - [`fusebox`] - kill switches
//! - [`status`] - replication status per target and mapping
//! - [`server`] - admin HTTP surface for the external scheduler
//!
//! # CLI Usage
//!
//! ```bash
//! # Install change tracking in the internal store
//! extdb-sync init-source --internal-database-url postgres://...
//!
//! # One sequencer pass, then one poller run
//! extdb-sync sequencer
//! extdb-sync poller
//!
//! # Admin API for the scheduler
//! CRON_SECRET=... extdb-sync serve --config extdb-sync.toml
//! ```

pub mod config;
pub mod connector;
pub mod engine;
pub mod fusebox;
pub mod poller;
pub mod registry;
pub mod sequencer;
pub mod server;
pub mod status;
pub mod testing;

pub use engine::{Engine, EngineOptions};
pub use poller::{PollerReport, PollerRun, TargetOutcome, TenancyOutcome};
pub use sequencer::SequencerReport;
