//! In-memory target sinks and a connector handing them out.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use checkpoint::{CheckpointID, CheckpointStore, MemoryStore, SyncCheckpoint};
use sync_core::{ChangeBatch, MappingName, ProjectedRow, SequenceId, TargetKind, UserProjection};
use target_sink::{ApplyStats, TargetSink};
use uuid::Uuid;

use crate::connector::TargetConnector;
use crate::registry::ResolvedTarget;

#[derive(Default)]
struct Tables {
    provisioned: BTreeSet<MappingName>,
    rows: HashMap<(Uuid, MappingName, Uuid), ProjectedRow>,
}

/// Target with the write semantics of the PostgreSQL sink: a batch and its
/// checkpoint apply atomically, and rows only move to equal or higher
/// versions.
pub struct MemoryTarget {
    kind: TargetKind,
    tables: Mutex<Tables>,
    checkpoints: MemoryStore,
    fail_applies: AtomicBool,
    stall_applies: AtomicBool,
    applied_batches: AtomicUsize,
}

impl MemoryTarget {
    pub fn new(kind: TargetKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            tables: Mutex::default(),
            checkpoints: MemoryStore::new(),
            fail_applies: AtomicBool::new(false),
            stall_applies: AtomicBool::new(false),
            applied_batches: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every following `apply_batch` fail before writing anything.
    pub fn set_fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    /// Make writes hang forever, like a target that stopped responding.
    pub fn set_stall_applies(&self, stall: bool) {
        self.stall_applies.store(stall, Ordering::SeqCst);
    }

    pub fn applied_batches(&self) -> usize {
        self.applied_batches.load(Ordering::SeqCst)
    }

    pub fn is_provisioned(&self, mapping: MappingName) -> bool {
        self.lock().provisioned.contains(&mapping)
    }

    /// Rows of one tenancy and mapping.
    pub fn rows(&self, tenancy_id: Uuid, mapping: MappingName) -> Vec<ProjectedRow> {
        self.lock()
            .rows
            .iter()
            .filter(|((t, m, _), _)| *t == tenancy_id && *m == mapping)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn users(&self, tenancy_id: Uuid) -> Vec<UserProjection> {
        self.rows(tenancy_id, MappingName::Users)
            .into_iter()
            .filter_map(|row| match row {
                ProjectedRow::User(user) => Some(user),
                ProjectedRow::ContactChannel(_) => None,
            })
            .collect()
    }

    pub fn user(&self, tenancy_id: Uuid, user_id: Uuid) -> Option<UserProjection> {
        self.users(tenancy_id).into_iter().find(|u| u.id == user_id)
    }

    /// Total rows across tenancies and mappings.
    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    pub async fn checkpoint(&self, tenancy_id: Uuid, mapping: MappingName) -> SequenceId {
        self.checkpoints
            .read_checkpoint(&CheckpointID::new(tenancy_id, mapping))
            .await
            .ok()
            .flatten()
            .map(|c| c.last_synced_sequence_id)
            .unwrap_or(checkpoint::NO_CHECKPOINT)
    }
}

#[async_trait]
impl CheckpointStore for MemoryTarget {
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<SyncCheckpoint>> {
        self.checkpoints.read_checkpoint(id).await
    }

    async fn write_checkpoint(&self, id: &CheckpointID, sequence_id: SequenceId) -> Result<()> {
        self.checkpoints.write_checkpoint(id, sequence_id).await
    }
}

#[async_trait]
impl TargetSink for MemoryTarget {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    async fn provision(&self, mappings: &[MappingName]) -> Result<()> {
        self.lock().provisioned.extend(mappings.iter().copied());
        Ok(())
    }

    async fn apply_batch(&self, tenancy_id: Uuid, batch: &ChangeBatch) -> Result<ApplyStats> {
        if self.fail_applies.load(Ordering::SeqCst) {
            anyhow::bail!("Simulated write failure");
        }
        if self.stall_applies.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let mut stats = ApplyStats::default();
        {
            let mut tables = self.lock();
            if !tables.provisioned.contains(&batch.mapping) {
                anyhow::bail!("Table '{}' does not exist", batch.mapping.table_name());
            }

            for row in &batch.upserts {
                let key = (tenancy_id, batch.mapping, row.entity_id());
                let newer = tables
                    .rows
                    .get(&key)
                    .map_or(true, |existing| existing.sequence_id() <= row.sequence_id());
                if newer {
                    tables.rows.insert(key, row.clone());
                    stats.upserted += 1;
                }
            }
            for delete in &batch.deletes {
                let key = (tenancy_id, batch.mapping, delete.entity_id);
                let removable = tables
                    .rows
                    .get(&key)
                    .is_some_and(|existing| existing.sequence_id() <= delete.sequence_id);
                if removable {
                    tables.rows.remove(&key);
                    stats.deleted += 1;
                }
            }
        }

        self.checkpoints
            .write_checkpoint(&CheckpointID::new(tenancy_id, batch.mapping), batch.high_watermark)
            .await?;
        self.applied_batches.fetch_add(1, Ordering::SeqCst);
        stats.checkpoint = batch.high_watermark;
        Ok(stats)
    }
}

/// Boxed handle over a shared [`MemoryTarget`].
struct TargetHandle(Arc<MemoryTarget>);

#[async_trait]
impl CheckpointStore for TargetHandle {
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<SyncCheckpoint>> {
        self.0.read_checkpoint(id).await
    }

    async fn write_checkpoint(&self, id: &CheckpointID, sequence_id: SequenceId) -> Result<()> {
        self.0.write_checkpoint(id, sequence_id).await
    }
}

#[async_trait]
impl TargetSink for TargetHandle {
    fn kind(&self) -> TargetKind {
        self.0.kind()
    }

    async fn provision(&self, mappings: &[MappingName]) -> Result<()> {
        self.0.provision(mappings).await
    }

    async fn apply_batch(&self, tenancy_id: Uuid, batch: &ChangeBatch) -> Result<ApplyStats> {
        self.0.apply_batch(tenancy_id, batch).await
    }
}

/// Hands out registered in-memory targets by connection descriptor.
/// Unregistered descriptors behave like unreachable hosts.
#[derive(Default)]
pub struct MemoryConnector {
    targets: Mutex<HashMap<String, Arc<MemoryTarget>>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, connection: &str, target: Arc<MemoryTarget>) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.insert(connection.to_string(), target);
        }
    }

    /// Make a registered target unreachable.
    pub fn unregister(&self, connection: &str) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.remove(connection);
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetConnector for MemoryConnector {
    async fn connect(&self, target: &ResolvedTarget) -> Result<Box<dyn TargetSink>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let found = self
            .targets
            .lock()
            .map_err(|_| anyhow::anyhow!("connector lock poisoned"))?
            .get(&target.connection)
            .cloned();
        match found {
            Some(sink) if sink.kind() == target.kind => Ok(Box::new(TargetHandle(sink))),
            Some(_) => anyhow::bail!("Target '{}' speaks a different protocol", target.name),
            None => anyhow::bail!(
                "Failed to connect to {} target '{}': connection refused",
                target.kind,
                target.name
            ),
        }
    }
}
