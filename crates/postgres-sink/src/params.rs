//! Statement parameters for projected rows, in mapping column order.

use sync_core::ProjectedRow;
use tokio_postgres::types::ToSql;

pub(crate) type Param = Box<dyn ToSql + Sync + Send>;

pub(crate) fn row_params(row: &ProjectedRow) -> Vec<Param> {
    match row {
        ProjectedRow::User(u) => vec![
            Box::new(u.id),
            Box::new(u.primary_email.clone()),
            Box::new(u.primary_email_verified),
            Box::new(u.display_name.clone()),
            Box::new(u.profile_image_url.clone()),
            Box::new(u.is_anonymous),
            Box::new(u.signed_up_at),
            Box::new(u.sequence_id),
        ],
        ProjectedRow::ContactChannel(c) => vec![
            Box::new(c.id),
            Box::new(c.user_id),
            Box::new(c.channel_type.clone()),
            Box::new(c.value.clone()),
            Box::new(c.is_primary),
            Box::new(c.is_verified),
            Box::new(c.created_at),
            Box::new(c.sequence_id),
        ],
    }
}

pub(crate) fn as_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sync_core::{ContactChannelProjection, MappingDefinition, UserProjection};
    use uuid::Uuid;

    #[test]
    fn test_param_count_matches_columns() {
        let user = ProjectedRow::User(UserProjection {
            id: Uuid::new_v4(),
            primary_email: None,
            primary_email_verified: None,
            display_name: None,
            profile_image_url: None,
            is_anonymous: true,
            signed_up_at: Utc::now(),
            sequence_id: 1,
        });
        let channel = ProjectedRow::ContactChannel(ContactChannelProjection {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            channel_type: "email".to_string(),
            value: "a@x.com".to_string(),
            is_primary: true,
            is_verified: false,
            created_at: Utc::now(),
            sequence_id: 2,
        });
        for row in [user, channel] {
            let def = MappingDefinition::of(row.mapping());
            assert_eq!(row_params(&row).len(), def.columns.len());
        }
    }
}
