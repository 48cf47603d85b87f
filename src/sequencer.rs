//! Sequencer entry point.
//!
//! Each pass stamps committed, not yet sequenced mutations with per
//! `(tenancy, mapping)` sequence numbers. Passes are idempotent and safe to
//! run concurrently, so a failed run is simply retried by the next trigger.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use anyhow::Result;
use extdb_sync_internal_source::{SequenceAssigner, SequencerPass};
use serde::Serialize;
use sync_core::MappingName;
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::Engine;
use crate::fusebox::FuseboxStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SequencerReport {
    pub iterations: u32,
    pub assigned: u64,
    pub assigned_by_mapping: BTreeMap<MappingName, u64>,
    pub tenancies: BTreeSet<Uuid>,
    pub stopped_by_fusebox: bool,
}

impl SequencerReport {
    fn record(&mut self, pass: SequencerPass) {
        self.assigned += pass.total();
        for (mapping, count) in pass.assigned {
            *self.assigned_by_mapping.entry(mapping).or_default() += count;
        }
        self.tenancies.extend(pass.tenancies);
    }
}

/// Run sequencer passes.
///
/// Without `max_duration` exactly one pass runs. With it, passes repeat
/// until one assigns nothing or the duration is used up. The fusebox is
/// checked before every pass.
pub async fn run_sequencer(
    assigner: &dyn SequenceAssigner,
    fusebox: &dyn FuseboxStore,
    batch_size: usize,
    max_duration: Option<Duration>,
) -> Result<SequencerReport> {
    let started = Instant::now();
    let mut report = SequencerReport::default();

    loop {
        if !fusebox.read_flags().await?.sequencer_enabled {
            info!("Sequencer disabled by fusebox, skipping");
            report.stopped_by_fusebox = true;
            break;
        }

        let pass = assigner.assign_pending(batch_size).await?;
        report.iterations += 1;
        let assigned = pass.total();
        debug!(
            iteration = report.iterations,
            assigned,
            tenancies = pass.tenancies.len(),
            "Sequencer pass finished"
        );
        report.record(pass);

        match max_duration {
            Some(max) if assigned > 0 && started.elapsed() < max => continue,
            _ => break,
        }
    }

    if report.assigned > 0 {
        info!(
            iterations = report.iterations,
            assigned = report.assigned,
            tenancies = report.tenancies.len(),
            "Sequencer assigned sequence numbers"
        );
    }
    Ok(report)
}

impl Engine {
    pub async fn run_sequencer(&self, max_duration: Option<Duration>) -> Result<SequencerReport> {
        run_sequencer(
            self.assigner.as_ref(),
            self.fusebox.as_ref(),
            self.options.sequencer_batch_size,
            max_duration,
        )
        .await
    }
}
