//! Projected entity rows and compacted change batches.

use crate::types::{ChangeOp, ChangeRecord, MappingName, SequenceId, NO_SEQUENCE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Target-side row of the `users` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProjection {
    pub id: Uuid,
    pub primary_email: Option<String>,
    pub primary_email_verified: Option<bool>,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub is_anonymous: bool,
    pub signed_up_at: DateTime<Utc>,
    pub sequence_id: SequenceId,
}

/// Target-side row of the `contact_channels` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactChannelProjection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub channel_type: String,
    pub value: String,
    pub is_primary: bool,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub sequence_id: SequenceId,
}

/// Current state of one entity, ready to be written to a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mapping", rename_all = "snake_case")]
pub enum ProjectedRow {
    User(UserProjection),
    ContactChannel(ContactChannelProjection),
}

impl ProjectedRow {
    pub fn mapping(&self) -> MappingName {
        match self {
            ProjectedRow::User(_) => MappingName::Users,
            ProjectedRow::ContactChannel(_) => MappingName::ContactChannels,
        }
    }

    pub fn entity_id(&self) -> Uuid {
        match self {
            ProjectedRow::User(u) => u.id,
            ProjectedRow::ContactChannel(c) => c.id,
        }
    }

    pub fn sequence_id(&self) -> SequenceId {
        match self {
            ProjectedRow::User(u) => u.sequence_id,
            ProjectedRow::ContactChannel(c) => c.sequence_id,
        }
    }

    fn set_sequence_id(&mut self, sequence_id: SequenceId) {
        match self {
            ProjectedRow::User(u) => u.sequence_id = sequence_id,
            ProjectedRow::ContactChannel(c) => c.sequence_id = sequence_id,
        }
    }
}

/// Removal of an entity, versioned by the sequence number that observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDelete {
    pub entity_id: Uuid,
    pub sequence_id: SequenceId,
}

/// One page of changes, compacted to at most one operation per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub mapping: MappingName,
    pub upserts: Vec<ProjectedRow>,
    pub deletes: Vec<EntityDelete>,
    /// Highest sequence number of the page; the checkpoint moves here.
    pub high_watermark: SequenceId,
}

impl ChangeBatch {
    /// Compact a page of change records against the entities' current state.
    ///
    /// The last record of each entity wins. An entity present in `current`
    /// becomes an upsert carrying its current values; an entity that no
    /// longer exists becomes a delete. `records` must be sorted by
    /// `sequence_id` ascending.
    pub fn compact(
        mapping: MappingName,
        records: &[ChangeRecord],
        mut current: HashMap<Uuid, ProjectedRow>,
    ) -> ChangeBatch {
        let mut last: HashMap<Uuid, &ChangeRecord> = HashMap::with_capacity(records.len());
        let mut order = Vec::with_capacity(records.len());
        for record in records {
            if last.insert(record.entity_id, record).is_none() {
                order.push(record.entity_id);
            }
        }

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for entity_id in order {
            let record = last[&entity_id];
            match current.remove(&entity_id) {
                Some(mut row) if record.op == ChangeOp::Upsert => {
                    if row.sequence_id() < record.sequence_id {
                        row.set_sequence_id(record.sequence_id);
                    }
                    upserts.push(row);
                }
                _ => deletes.push(EntityDelete {
                    entity_id,
                    sequence_id: record.sequence_id,
                }),
            }
        }

        let high_watermark = records
            .iter()
            .map(|r| r.sequence_id)
            .max()
            .unwrap_or(NO_SEQUENCE);

        ChangeBatch {
            mapping,
            upserts,
            deletes,
            high_watermark,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: Uuid, name: &str, seq: SequenceId) -> ProjectedRow {
        ProjectedRow::User(UserProjection {
            id,
            primary_email: Some("a@x.com".to_string()),
            primary_email_verified: Some(true),
            display_name: Some(name.to_string()),
            profile_image_url: None,
            is_anonymous: false,
            signed_up_at: Utc::now(),
            sequence_id: seq,
        })
    }

    fn record(entity_id: Uuid, seq: SequenceId, op: ChangeOp) -> ChangeRecord {
        ChangeRecord {
            tenancy_id: Uuid::nil(),
            mapping: MappingName::Users,
            sequence_id: seq,
            entity_id,
            op,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_compact_last_record_wins() {
        let id = Uuid::new_v4();
        let records = vec![
            record(id, 1, ChangeOp::Upsert),
            record(id, 2, ChangeOp::Upsert),
            record(id, 3, ChangeOp::Upsert),
        ];
        let current = HashMap::from([(id, user(id, "V3", 3))]);
        let batch = ChangeBatch::compact(MappingName::Users, &records, current);

        assert_eq!(batch.upserts.len(), 1);
        assert!(batch.deletes.is_empty());
        assert_eq!(batch.high_watermark, 3);
        match &batch.upserts[0] {
            ProjectedRow::User(u) => assert_eq!(u.display_name.as_deref(), Some("V3")),
            other => panic!("unexpected row: {other:?}"),
        }
    }

    #[test]
    fn test_compact_missing_entity_becomes_delete() {
        let gone = Uuid::new_v4();
        let records = vec![record(gone, 7, ChangeOp::Upsert)];
        let batch = ChangeBatch::compact(MappingName::Users, &records, HashMap::new());

        assert!(batch.upserts.is_empty());
        assert_eq!(
            batch.deletes,
            vec![EntityDelete {
                entity_id: gone,
                sequence_id: 7
            }]
        );
    }

    #[test]
    fn test_compact_tombstone_wins_over_stale_state() {
        let id = Uuid::new_v4();
        let records = vec![record(id, 4, ChangeOp::Upsert), record(id, 5, ChangeOp::Delete)];
        // A row still visible at materialization time must not override its tombstone.
        let current = HashMap::from([(id, user(id, "stale", 4))]);
        let batch = ChangeBatch::compact(MappingName::Users, &records, current);

        assert!(batch.upserts.is_empty());
        assert_eq!(batch.deletes[0].sequence_id, 5);
    }

    #[test]
    fn test_compact_version_never_behind_record() {
        let id = Uuid::new_v4();
        let records = vec![record(id, 9, ChangeOp::Upsert)];
        let current = HashMap::from([(id, user(id, "x", 2))]);
        let batch = ChangeBatch::compact(MappingName::Users, &records, current);
        assert_eq!(batch.upserts[0].sequence_id(), 9);
    }

    #[test]
    fn test_compact_empty_page() {
        let batch = ChangeBatch::compact(MappingName::ContactChannels, &[], HashMap::new());
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.high_watermark, NO_SEQUENCE);
    }
}
