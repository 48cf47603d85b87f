//! Poller: drives every `(tenancy, target, mapping)` triple toward the
//! latest committed sequence number.
//!
//! Per target and run:
//!
//! 1. connect and provision (idempotent DDL)
//! 2. per mapping, read the checkpoint stored in the target
//! 3. fetch a page of change records past the checkpoint
//! 4. materialize the current state of the touched entities
//! 5. compact and apply the page, advancing the checkpoint with it
//! 6. repeat until a short page ends the backlog
//!
//! Every triple owns its checkpoint, so targets run in parallel and a
//! failing target only leaves itself behind. Once every target of a tenancy
//! has synced, tombstones below the lowest checkpoint are pruned.

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use checkpoint::CheckpointID;
use extdb_sync_internal_source::TenancyRecord;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sync_core::{ChangeBatch, MappingName, SequenceId, TargetKind, NO_SEQUENCE};
use target_sink::TargetSink;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::registry::{self, RegistryError, ResolvedTarget};

/// Progress of one mapping on one target during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MappingProgress {
    pub batches: usize,
    pub upserted: usize,
    pub deleted: usize,
    /// Checkpoint after the run.
    pub checkpoint: SequenceId,
    /// Stopped by `max_batches_per_mapping` with more pages possibly left.
    pub throttled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetOutcome {
    Synced {
        mappings: BTreeMap<MappingName, MappingProgress>,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetReport {
    pub name: String,
    /// Absent when the target's configuration could not be resolved.
    pub kind: Option<TargetKind>,
    pub managed: bool,
    #[serde(flatten)]
    pub outcome: TargetOutcome,
}

impl TargetReport {
    pub fn is_synced(&self) -> bool {
        matches!(self.outcome, TargetOutcome::Synced { .. })
    }

    fn rows_applied(&self) -> usize {
        match &self.outcome {
            TargetOutcome::Synced { mappings } => {
                mappings.values().map(|m| m.upserted + m.deleted).sum()
            }
            TargetOutcome::Failed { .. } => 0,
        }
    }

    fn throttled(&self) -> bool {
        match &self.outcome {
            TargetOutcome::Synced { mappings } => mappings.values().any(|m| m.throttled),
            TargetOutcome::Failed { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenancyOutcome {
    pub tenancy_id: Uuid,
    pub targets: Vec<TargetReport>,
    /// Set when the tenancy's target configuration could not be read. The
    /// reserved target is synced regardless.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollerReport {
    pub tenancies: Vec<TenancyOutcome>,
    /// Some mapping hit `max_batches_per_mapping`; run again soon.
    pub throttled: bool,
    pub stopped_by_fusebox: bool,
}

impl PollerReport {
    fn targets(&self) -> impl Iterator<Item = &TargetReport> {
        self.tenancies.iter().flat_map(|t| t.targets.iter())
    }

    pub fn targets_synced(&self) -> usize {
        self.targets().filter(|t| t.is_synced()).count()
    }

    pub fn targets_failed(&self) -> usize {
        self.targets().filter(|t| !t.is_synced()).count()
    }

    pub fn rows_applied(&self) -> usize {
        self.targets().map(TargetReport::rows_applied).sum()
    }
}

/// Summary of a time-bounded sequence of poller runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PollerRun {
    pub iterations: u32,
    pub rows_applied: usize,
    /// Report of the last run.
    pub last: PollerReport,
}

/// One unit of concurrent work.
struct TargetJob {
    tenancy_id: Uuid,
    target: Result<ResolvedTarget, RegistryError>,
}

impl Engine {
    /// Sync every tenancy's targets once.
    pub async fn run_poller(&self) -> Result<PollerReport> {
        if !self.fusebox.read_flags().await?.poller_enabled {
            info!("Poller disabled by fusebox, skipping");
            return Ok(stopped_report());
        }
        let tenancies = self
            .tenants
            .list_tenancies()
            .await
            .context("Failed to list tenancies")?;
        Ok(self.sync_tenancies(tenancies).await)
    }

    /// Sync one tenancy's targets once.
    pub async fn run_poller_for(&self, tenancy_id: Uuid) -> Result<PollerReport> {
        if !self.fusebox.read_flags().await?.poller_enabled {
            info!(tenancy_id = %tenancy_id, "Poller disabled by fusebox, skipping");
            return Ok(stopped_report());
        }
        let tenancy = self
            .tenants
            .get_tenancy(tenancy_id)
            .await?
            .with_context(|| format!("Tenancy {tenancy_id} not found"))?;
        Ok(self.sync_tenancies(vec![tenancy]).await)
    }

    /// Repeat poller runs until `max_duration` is used up, pausing
    /// `poll_interval` after runs that found nothing to apply. Without a
    /// bound exactly one run happens.
    pub async fn poll(
        &self,
        tenancy_id: Option<Uuid>,
        max_duration: Option<Duration>,
    ) -> Result<PollerRun> {
        let started = Instant::now();
        let mut run = PollerRun::default();

        loop {
            let report = match tenancy_id {
                Some(id) => self.run_poller_for(id).await?,
                None => self.run_poller().await?,
            };
            run.iterations += 1;
            let applied = report.rows_applied();
            run.rows_applied += applied;
            let stopped = report.stopped_by_fusebox;
            let throttled = report.throttled;
            run.last = report;

            let Some(max) = max_duration else { break };
            let elapsed = started.elapsed();
            if stopped || elapsed >= max {
                break;
            }
            if applied == 0 && !throttled {
                tokio::time::sleep(self.options.poll_interval.min(max - elapsed)).await;
                if started.elapsed() >= max {
                    break;
                }
            }
        }
        Ok(run)
    }

    async fn sync_tenancies(&self, tenancies: Vec<TenancyRecord>) -> PollerReport {
        let mut outcomes = Vec::with_capacity(tenancies.len());
        let mut jobs = Vec::new();

        for tenancy in &tenancies {
            let resolution = registry::resolve(&tenancy.external_databases, &self.platform);
            if let Some(e) = &resolution.config_error {
                warn!(tenancy_id = %tenancy.id, "Syncing managed targets only: {e}");
            }
            jobs.extend(resolution.targets.into_iter().map(|target| TargetJob {
                tenancy_id: tenancy.id,
                target,
            }));
            outcomes.push(TenancyOutcome {
                tenancy_id: tenancy.id,
                targets: Vec::new(),
                error: resolution.config_error.map(|e| e.to_string()),
            });
        }

        let results: Vec<(Uuid, TargetReport)> = stream::iter(jobs)
            .map(|job| async move {
                let report = self.sync_target(job.tenancy_id, job.target).await;
                (job.tenancy_id, report)
            })
            .buffer_unordered(self.options.target_concurrency.max(1))
            .collect()
            .await;

        for (tenancy_id, report) in results {
            if let Some(outcome) = outcomes.iter_mut().find(|o| o.tenancy_id == tenancy_id) {
                outcome.targets.push(report);
            }
        }
        // Completion order is arbitrary; report in resolution order.
        for outcome in &mut outcomes {
            outcome
                .targets
                .sort_by(|a, b| (!a.managed, &a.name).cmp(&(!b.managed, &b.name)));
        }
        for outcome in &outcomes {
            self.prune_tombstones(outcome).await;
        }

        let report = PollerReport {
            throttled: outcomes
                .iter()
                .flat_map(|o| o.targets.iter())
                .any(TargetReport::throttled),
            tenancies: outcomes,
            stopped_by_fusebox: false,
        };
        debug!(
            tenancies = report.tenancies.len(),
            targets_synced = report.targets_synced(),
            targets_failed = report.targets_failed(),
            rows = report.rows_applied(),
            "Poller run finished"
        );
        report
    }

    async fn sync_target(
        &self,
        tenancy_id: Uuid,
        target: Result<ResolvedTarget, RegistryError>,
    ) -> TargetReport {
        let target = match target {
            Ok(target) => target,
            Err(e) => {
                warn!(tenancy_id = %tenancy_id, "Invalid external database: {e}");
                return TargetReport {
                    name: e.target_name().unwrap_or_default().to_string(),
                    kind: None,
                    managed: false,
                    outcome: TargetOutcome::Failed {
                        error: e.to_string(),
                    },
                };
            }
        };

        let timeout = self.options.target_timeout;
        let attempt = tokio::time::timeout(timeout, self.try_sync_target(tenancy_id, &target))
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!(
                    "Target sync did not finish within {timeout:?}"
                ))
            });
        let outcome = match attempt {
            Ok(mappings) => TargetOutcome::Synced { mappings },
            Err(e) => {
                error!(
                    tenancy_id = %tenancy_id,
                    sink = %target.name,
                    kind = %target.kind,
                    "Target sync failed: {e:#}"
                );
                TargetOutcome::Failed {
                    error: format!("{e:#}"),
                }
            }
        };

        TargetReport {
            name: target.name,
            kind: Some(target.kind),
            managed: target.managed,
            outcome,
        }
    }

    async fn try_sync_target(
        &self,
        tenancy_id: Uuid,
        target: &ResolvedTarget,
    ) -> Result<BTreeMap<MappingName, MappingProgress>> {
        let sink = self.connector.connect(target).await?;
        sink.provision(&MappingName::ALL)
            .await
            .with_context(|| format!("Failed to provision target '{}'", target.name))?;

        let mut mappings = BTreeMap::new();
        for mapping in MappingName::ALL {
            let progress = self
                .sync_mapping(sink.as_ref(), tenancy_id, mapping)
                .await
                .with_context(|| format!("Failed to sync mapping '{mapping}'"))?;
            if progress.batches > 0 {
                info!(
                    tenancy_id = %tenancy_id,
                    sink = %target.name,
                    mapping = %mapping,
                    batches = progress.batches,
                    upserted = progress.upserted,
                    deleted = progress.deleted,
                    checkpoint = progress.checkpoint,
                    "Synced mapping"
                );
            }
            mappings.insert(mapping, progress);
        }
        Ok(mappings)
    }

    /// Drop tombstones every target of the tenancy has applied. Skipped
    /// unless the whole configuration resolved and every target synced.
    async fn prune_tombstones(&self, outcome: &TenancyOutcome) {
        if outcome.error.is_some() || outcome.targets.is_empty() {
            return;
        }
        let mut applied: BTreeMap<MappingName, SequenceId> = BTreeMap::new();
        for target in &outcome.targets {
            let TargetOutcome::Synced { mappings } = &target.outcome else {
                return;
            };
            for mapping in MappingName::ALL {
                let checkpoint = mappings
                    .get(&mapping)
                    .map_or(NO_SEQUENCE, |m| m.checkpoint);
                applied
                    .entry(mapping)
                    .and_modify(|low| *low = (*low).min(checkpoint))
                    .or_insert(checkpoint);
            }
        }

        for (mapping, up_to) in applied {
            if up_to == NO_SEQUENCE {
                continue;
            }
            if let Err(e) = self
                .source
                .prune_tombstones(outcome.tenancy_id, mapping, up_to)
                .await
            {
                warn!(
                    tenancy_id = %outcome.tenancy_id,
                    mapping = %mapping,
                    "Failed to prune tombstones: {e:#}"
                );
            }
        }
    }

    /// Page loop of one mapping on one target.
    ///
    /// Pages are driven by sequence number only, so deletes near a page
    /// boundary are never skipped.
    async fn sync_mapping(
        &self,
        sink: &dyn TargetSink,
        tenancy_id: Uuid,
        mapping: MappingName,
    ) -> Result<MappingProgress> {
        let id = CheckpointID::new(tenancy_id, mapping);
        let mut after = checkpoint::last_synced(sink, &id).await?;
        let mut progress = MappingProgress {
            checkpoint: after,
            ..Default::default()
        };
        let page_size = self.options.page_size;

        loop {
            if self
                .options
                .max_batches_per_mapping
                .is_some_and(|max| progress.batches >= max)
            {
                progress.throttled = true;
                break;
            }

            let records = self
                .source
                .fetch_changes(tenancy_id, mapping, after, page_size)
                .await?;
            if records.is_empty() {
                break;
            }

            let mut seen = HashSet::with_capacity(records.len());
            let entity_ids: Vec<Uuid> = records
                .iter()
                .map(|r| r.entity_id)
                .filter(|id| seen.insert(*id))
                .collect();
            let current = self
                .source
                .materialize(tenancy_id, mapping, &entity_ids)
                .await?;
            let batch = ChangeBatch::compact(mapping, &records, current);

            let stats = sink.apply_batch(tenancy_id, &batch).await?;
            progress.batches += 1;
            progress.upserted += stats.upserted;
            progress.deleted += stats.deleted;
            after = checkpoint::advance(after, batch.high_watermark);
            progress.checkpoint = after;

            if records.len() < page_size {
                break;
            }
        }
        Ok(progress)
    }
}

fn stopped_report() -> PollerReport {
    PollerReport {
        stopped_by_fusebox: true,
        ..Default::default()
    }
}
