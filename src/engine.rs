//! Wiring of the internal store, the fusebox and the target connector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use extdb_sync_internal_source::{
    ChangeSource, InternalStore, SequenceAssigner, SourceOpts, TenantDirectory,
};

use crate::config::Settings;
use crate::connector::{KindConnector, TargetConnector};
use crate::fusebox::FuseboxStore;
use crate::registry::PlatformTargets;

/// Tuning shared by the sequencer and the poller.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub page_size: usize,
    pub sequencer_batch_size: usize,
    pub max_batches_per_mapping: Option<usize>,
    pub target_concurrency: usize,
    pub poll_interval: Duration,
    /// Upper bound on syncing one target in one poller run.
    pub target_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: 1000,
            sequencer_batch_size: 1000,
            max_batches_per_mapping: None,
            target_concurrency: 8,
            poll_interval: Duration::from_millis(50),
            target_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&Settings> for EngineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            page_size: settings.page_size,
            sequencer_batch_size: settings.sequencer_batch_size,
            max_batches_per_mapping: settings.max_batches_per_mapping,
            target_concurrency: settings.target_concurrency,
            poll_interval: settings.poll_interval,
            target_timeout: settings.target_timeout,
        }
    }
}

/// Everything a sequencer or poller run needs. Cheap to clone.
///
/// Holds no replication state of its own: sequence numbers live in the
/// internal store and checkpoints live in the targets.
#[derive(Clone)]
pub struct Engine {
    pub(crate) source: Arc<dyn ChangeSource>,
    pub(crate) assigner: Arc<dyn SequenceAssigner>,
    pub(crate) tenants: Arc<dyn TenantDirectory>,
    pub(crate) fusebox: Arc<dyn FuseboxStore>,
    pub(crate) connector: Arc<dyn TargetConnector>,
    pub(crate) platform: PlatformTargets,
    pub(crate) options: EngineOptions,
}

impl Engine {
    /// Build an engine over one store serving every internal-store role.
    pub fn new<S>(
        store: Arc<S>,
        connector: Arc<dyn TargetConnector>,
        platform: PlatformTargets,
        options: EngineOptions,
    ) -> Self
    where
        S: ChangeSource + SequenceAssigner + TenantDirectory + FuseboxStore + 'static,
    {
        Self {
            source: store.clone(),
            assigner: store.clone(),
            tenants: store.clone(),
            fusebox: store,
            connector,
            platform,
            options,
        }
    }

    /// Connect to the internal store named by `settings`.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let store = InternalStore::connect(&SourceOpts {
            source_uri: settings.require_internal_database_url()?.to_string(),
        })
        .await?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(KindConnector),
            PlatformTargets {
                default_clickhouse_url: settings.default_clickhouse_url.clone(),
            },
            EngineOptions::from(settings),
        ))
    }

    pub fn fusebox(&self) -> &dyn FuseboxStore {
        self.fusebox.as_ref()
    }

    pub fn tenants(&self) -> &dyn TenantDirectory {
        self.tenants.as_ref()
    }
}
