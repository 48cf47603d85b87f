//! In-memory test infrastructure
//!
//! Fakes for every collaborator of the engine, so sequencing and
//! replication scenarios run without external databases:
//!
//! - [`MemoryInternalStore`] - internal store with staged, uncommitted transactions
//! - [`MemoryTarget`] - target with transactional, version-guarded writes
//! - [`MemoryConnector`] - connector resolving descriptors to registered targets
//! - [`Harness`] - an [`Engine`] wired to the above

pub mod source;
pub mod target;

use std::sync::Arc;

use serde_json::{json, Value};
use sync_core::TargetKind;
use uuid::Uuid;

use crate::engine::{Engine, EngineOptions};
use crate::registry::PlatformTargets;

pub use source::{ChannelData, MemoryInternalStore, PendingTransaction, UserData};
pub use target::{MemoryConnector, MemoryTarget};

/// Connection descriptor of the reserved target in tests.
pub const DEFAULT_CLICKHOUSE_URL: &str = "http://default-clickhouse:8123/stack";

/// Engine over in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryInternalStore>,
    pub connector: Arc<MemoryConnector>,
    /// Reserved target shared by every tenancy.
    pub default_target: Arc<MemoryTarget>,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let store = Arc::new(MemoryInternalStore::new());
        let connector = MemoryConnector::new();
        let default_target = MemoryTarget::new(TargetKind::ClickHouse);
        connector.register(DEFAULT_CLICKHOUSE_URL, default_target.clone());

        let engine = Engine::new(
            store.clone(),
            connector.clone(),
            PlatformTargets {
                default_clickhouse_url: DEFAULT_CLICKHOUSE_URL.to_string(),
            },
            options,
        );
        Self {
            store,
            connector,
            default_target,
            engine,
        }
    }

    /// Register a reachable PostgreSQL target and return its descriptor.
    pub fn postgres_target(&self, host: &str) -> (String, Arc<MemoryTarget>) {
        let connection = postgres_descriptor(host);
        let target = MemoryTarget::new(TargetKind::Postgres);
        self.connector.register(&connection, target.clone());
        (connection, target)
    }

    /// Create a tenancy whose configuration names the given PostgreSQL
    /// targets.
    pub fn tenancy_with_targets(&self, targets: &[(&str, &str)]) -> Uuid {
        let config: serde_json::Map<String, Value> = targets
            .iter()
            .map(|(name, connection)| {
                (
                    name.to_string(),
                    json!({ "type": "postgres", "connectionString": connection }),
                )
            })
            .collect();
        self.store
            .create_tenancy("test-project", Value::Object(config))
    }

    /// Run the sequencer to exhaustion, then one poller run.
    pub async fn sync(&self) -> anyhow::Result<crate::poller::PollerReport> {
        self.engine
            .run_sequencer(Some(std::time::Duration::from_secs(5)))
            .await?;
        self.engine.run_poller().await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// PostgreSQL descriptor for a test host.
pub fn postgres_descriptor(host: &str) -> String {
    format!("postgres://sync:secret@{host}:5432/app")
}
