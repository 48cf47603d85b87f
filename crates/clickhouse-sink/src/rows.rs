//! RowBinary row types for ClickHouse inserts and checkpoint reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::{ContactChannelProjection, EntityDelete, SequenceId, UserProjection};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub(crate) struct UserRow {
    #[serde(with = "clickhouse::serde::uuid")]
    pub tenancy_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub id: Uuid,
    pub primary_email: Option<String>,
    pub primary_email_verified: Option<bool>,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub is_anonymous: bool,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub signed_up_at: DateTime<Utc>,
    pub sequence_id: SequenceId,
    pub is_deleted: u8,
}

impl UserRow {
    pub fn live(tenancy_id: Uuid, user: &UserProjection) -> Self {
        Self {
            tenancy_id,
            id: user.id,
            primary_email: user.primary_email.clone(),
            primary_email_verified: user.primary_email_verified,
            display_name: user.display_name.clone(),
            profile_image_url: user.profile_image_url.clone(),
            is_anonymous: user.is_anonymous,
            signed_up_at: user.signed_up_at,
            sequence_id: user.sequence_id,
            is_deleted: 0,
        }
    }

    pub fn tombstone(tenancy_id: Uuid, delete: &EntityDelete) -> Self {
        Self {
            tenancy_id,
            id: delete.entity_id,
            primary_email: None,
            primary_email_verified: None,
            display_name: None,
            profile_image_url: None,
            is_anonymous: false,
            signed_up_at: DateTime::<Utc>::UNIX_EPOCH,
            sequence_id: delete.sequence_id,
            is_deleted: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub(crate) struct ContactChannelRow {
    #[serde(with = "clickhouse::serde::uuid")]
    pub tenancy_id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub user_id: Uuid,
    pub channel_type: String,
    pub value: String,
    pub is_primary: bool,
    pub is_verified: bool,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub created_at: DateTime<Utc>,
    pub sequence_id: SequenceId,
    pub is_deleted: u8,
}

impl ContactChannelRow {
    pub fn live(tenancy_id: Uuid, channel: &ContactChannelProjection) -> Self {
        Self {
            tenancy_id,
            id: channel.id,
            user_id: channel.user_id,
            channel_type: channel.channel_type.clone(),
            value: channel.value.clone(),
            is_primary: channel.is_primary,
            is_verified: channel.is_verified,
            created_at: channel.created_at,
            sequence_id: channel.sequence_id,
            is_deleted: 0,
        }
    }

    pub fn tombstone(tenancy_id: Uuid, delete: &EntityDelete) -> Self {
        Self {
            tenancy_id,
            id: delete.entity_id,
            user_id: Uuid::nil(),
            channel_type: String::new(),
            value: String::new(),
            is_primary: false,
            is_verified: false,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            sequence_id: delete.sequence_id,
            is_deleted: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub(crate) struct MetadataRow {
    #[serde(with = "clickhouse::serde::uuid")]
    pub tenancy_id: Uuid,
    pub mapping_name: String,
    pub last_synced_sequence_id: SequenceId,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub updated_at: DateTime<Utc>,
}

/// Result of the checkpoint aggregate; `entries == 0` means no checkpoint.
#[derive(Debug, Clone, Deserialize, clickhouse::Row)]
pub(crate) struct CheckpointProbe {
    pub entries: u64,
    pub last_synced_sequence_id: SequenceId,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_carries_delete_version() {
        let tenancy = Uuid::new_v4();
        let delete = EntityDelete {
            entity_id: Uuid::new_v4(),
            sequence_id: 42,
        };
        let user = UserRow::tombstone(tenancy, &delete);
        assert_eq!(user.is_deleted, 1);
        assert_eq!(user.sequence_id, 42);
        assert_eq!(user.id, delete.entity_id);

        let channel = ContactChannelRow::tombstone(tenancy, &delete);
        assert_eq!(channel.is_deleted, 1);
        assert_eq!(channel.tenancy_id, tenancy);
    }

    #[test]
    fn test_live_row_copies_projection() {
        let user = UserProjection {
            id: Uuid::new_v4(),
            primary_email: Some("a@x.com".to_string()),
            primary_email_verified: Some(false),
            display_name: Some("V3".to_string()),
            profile_image_url: None,
            is_anonymous: false,
            signed_up_at: Utc::now(),
            sequence_id: 3,
        };
        let row = UserRow::live(Uuid::nil(), &user);
        assert_eq!(row.is_deleted, 0);
        assert_eq!(row.display_name.as_deref(), Some("V3"));
        assert_eq!(row.sequence_id, 3);
    }
}
