//! Replication status of a tenancy's targets.

use anyhow::Result;
use checkpoint::{CheckpointID, NO_CHECKPOINT};
use serde::Serialize;
use sync_core::{MappingName, SequenceId, TargetKind};
use tracing::debug;
use uuid::Uuid;

use crate::engine::Engine;
use crate::registry::{self, ResolvedTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingStatus {
    pub mapping: MappingName,
    /// Highest sequence number handed out in the internal store.
    pub internal_max_sequence_id: Option<SequenceId>,
    pub last_synced_sequence_id: SequenceId,
    /// Sequence numbers not yet applied to the target.
    pub backlog: i64,
}

impl MappingStatus {
    fn new(
        mapping: MappingName,
        internal_max_sequence_id: Option<SequenceId>,
        last_synced_sequence_id: SequenceId,
    ) -> Self {
        // Numbers start at 1 and are gap-free per (tenancy, mapping).
        let floor = last_synced_sequence_id.max(0);
        let backlog = internal_max_sequence_id
            .map(|max| (max - floor).max(0))
            .unwrap_or(0);
        Self {
            mapping,
            internal_max_sequence_id,
            last_synced_sequence_id,
            backlog,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub name: String,
    pub kind: Option<TargetKind>,
    pub managed: bool,
    /// Connection descriptor with credentials removed.
    pub connection: Option<String>,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub mappings: Vec<MappingStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenancyStatus {
    pub tenancy_id: Uuid,
    pub project_id: String,
    pub targets: Vec<TargetStatus>,
}

impl Engine {
    /// Status of every target of a tenancy, or `None` for an unknown tenancy.
    ///
    /// Read-only: targets are neither provisioned nor written.
    pub async fn tenancy_status(&self, tenancy_id: Uuid) -> Result<Option<TenancyStatus>> {
        let Some(tenancy) = self.tenants.get_tenancy(tenancy_id).await? else {
            return Ok(None);
        };

        let mut internal = Vec::with_capacity(MappingName::ALL.len());
        for mapping in MappingName::ALL {
            internal.push((
                mapping,
                self.source.max_sequence_id(tenancy_id, mapping).await?,
            ));
        }

        let mut targets = Vec::new();
        let resolution = registry::resolve(&tenancy.external_databases, &self.platform);
        if let Some(e) = &resolution.config_error {
            debug!(tenancy_id = %tenancy_id, "Unreadable target configuration: {e}");
        }
        for entry in resolution.targets {
            let status = match entry {
                Ok(target) => self.target_status(tenancy_id, &target, &internal).await,
                Err(e) => TargetStatus {
                    name: e.target_name().unwrap_or_default().to_string(),
                    kind: None,
                    managed: false,
                    connection: None,
                    reachable: false,
                    error: Some(e.to_string()),
                    mappings: Vec::new(),
                },
            };
            targets.push(status);
        }

        Ok(Some(TenancyStatus {
            tenancy_id,
            project_id: tenancy.project_id,
            targets,
        }))
    }

    async fn target_status(
        &self,
        tenancy_id: Uuid,
        target: &ResolvedTarget,
        internal: &[(MappingName, Option<SequenceId>)],
    ) -> TargetStatus {
        let mut status = TargetStatus {
            name: target.name.clone(),
            kind: Some(target.kind),
            managed: target.managed,
            connection: Some(target.redacted_connection()),
            reachable: false,
            error: None,
            mappings: Vec::new(),
        };

        let sink = match self.connector.connect(target).await {
            Ok(sink) => sink,
            Err(e) => {
                status.error = Some(format!("{e:#}"));
                return status;
            }
        };
        status.reachable = true;

        for (mapping, internal_max) in internal {
            let id = CheckpointID::new(tenancy_id, *mapping);
            let last_synced = match checkpoint::last_synced(sink.as_ref(), &id).await {
                Ok(value) => value,
                Err(e) => {
                    // Typically an unprovisioned target.
                    status.error.get_or_insert_with(|| format!("{e:#}"));
                    NO_CHECKPOINT
                }
            };
            status
                .mappings
                .push(MappingStatus::new(*mapping, *internal_max, last_synced));
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog() {
        let status = MappingStatus::new(MappingName::Users, Some(1500), NO_CHECKPOINT);
        assert_eq!(status.backlog, 1500);
        let status = MappingStatus::new(MappingName::Users, Some(1500), 1000);
        assert_eq!(status.backlog, 500);
        let status = MappingStatus::new(MappingName::Users, None, NO_CHECKPOINT);
        assert_eq!(status.backlog, 0);
        let status = MappingStatus::new(MappingName::Users, Some(10), 12);
        assert_eq!(status.backlog, 0);
    }
}
