//! Internal store bootstrap: tracked tables, tracking columns, tombstones,
//! sequence counters, fusebox and triggers.
//!
//! Every statement is idempotent; `init_source_schema` can run on every
//! deployment.

use anyhow::{Context, Result};
use log::info;
use sync_core::MappingName;

use crate::InternalStore;

pub const USERS_TABLE: &str = "project_users";
pub const CONTACT_CHANNELS_TABLE: &str = "contact_channels";
pub const TOMBSTONE_TABLE: &str = "deleted_rows";
pub const COUNTER_TABLE: &str = "sync_sequence_counters";
pub const FUSEBOX_TABLE: &str = "external_db_sync_fusebox";

/// Internal source table holding the live rows of a mapping.
pub fn source_table(mapping: MappingName) -> &'static str {
    match mapping {
        MappingName::Users => USERS_TABLE,
        MappingName::ContactChannels => CONTACT_CHANNELS_TABLE,
    }
}

/// Mapping whose change stream a source table feeds.
pub fn mapping_for_table(table: &str) -> Option<MappingName> {
    match table {
        USERS_TABLE => Some(MappingName::Users),
        CONTACT_CHANNELS_TABLE => Some(MappingName::ContactChannels),
        _ => None,
    }
}

const TABLES: &str = "
CREATE TABLE IF NOT EXISTS tenancies (
    id UUID PRIMARY KEY,
    project_id TEXT NOT NULL,
    external_databases JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS project_users (
    tenancy_id UUID NOT NULL REFERENCES tenancies (id) ON DELETE CASCADE,
    id UUID NOT NULL,
    display_name TEXT,
    profile_image_url TEXT,
    is_anonymous BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (tenancy_id, id)
);

CREATE TABLE IF NOT EXISTS contact_channels (
    tenancy_id UUID NOT NULL,
    id UUID NOT NULL,
    user_id UUID NOT NULL,
    channel_type TEXT NOT NULL,
    value TEXT NOT NULL,
    is_primary BOOLEAN NOT NULL DEFAULT FALSE,
    is_verified BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (tenancy_id, id),
    FOREIGN KEY (tenancy_id, user_id) REFERENCES project_users (tenancy_id, id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS deleted_rows (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    tenancy_id UUID NOT NULL,
    table_name TEXT NOT NULL,
    entity_id UUID NOT NULL,
    data JSONB,
    deleted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    sequence_id BIGINT,
    should_update_sequence_id BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS sync_sequence_counters (
    tenancy_id UUID NOT NULL,
    mapping_name TEXT NOT NULL,
    last_value BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (tenancy_id, mapping_name)
);

CREATE TABLE IF NOT EXISTS external_db_sync_fusebox (
    id BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (id),
    sequencer_enabled BOOLEAN NOT NULL DEFAULT TRUE,
    poller_enabled BOOLEAN NOT NULL DEFAULT TRUE,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
INSERT INTO external_db_sync_fusebox (id) VALUES (TRUE) ON CONFLICT (id) DO NOTHING;
";

const TRACKING_COLUMNS: &str = "
ALTER TABLE project_users
    ADD COLUMN IF NOT EXISTS sequence_id BIGINT,
    ADD COLUMN IF NOT EXISTS should_update_sequence_id BOOLEAN NOT NULL DEFAULT TRUE;
ALTER TABLE contact_channels
    ADD COLUMN IF NOT EXISTS sequence_id BIGINT,
    ADD COLUMN IF NOT EXISTS should_update_sequence_id BOOLEAN NOT NULL DEFAULT TRUE;

CREATE INDEX IF NOT EXISTS project_users_sequence_idx ON project_users (tenancy_id, sequence_id);
CREATE INDEX IF NOT EXISTS project_users_pending_idx ON project_users (tenancy_id) WHERE should_update_sequence_id;
CREATE INDEX IF NOT EXISTS contact_channels_sequence_idx ON contact_channels (tenancy_id, sequence_id);
CREATE INDEX IF NOT EXISTS contact_channels_pending_idx ON contact_channels (tenancy_id) WHERE should_update_sequence_id;
CREATE INDEX IF NOT EXISTS contact_channels_user_idx ON contact_channels (tenancy_id, user_id);
CREATE INDEX IF NOT EXISTS deleted_rows_sequence_idx ON deleted_rows (tenancy_id, table_name, sequence_id);
CREATE INDEX IF NOT EXISTS deleted_rows_pending_idx ON deleted_rows (deleted_at) WHERE should_update_sequence_id;
";

const TRIGGER_FUNCTIONS: &str = "
CREATE OR REPLACE FUNCTION extdb_sync_mark_row() RETURNS TRIGGER AS $$
BEGIN
    -- The sequencer's own stamp must not re-mark the row.
    IF TG_OP = 'UPDATE' AND NEW.sequence_id IS DISTINCT FROM OLD.sequence_id THEN
        RETURN NEW;
    END IF;
    NEW.should_update_sequence_id := TRUE;
    IF TG_OP = 'UPDATE' THEN
        NEW.updated_at := now();
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION extdb_sync_record_delete() RETURNS TRIGGER AS $$
BEGIN
    INSERT INTO deleted_rows (tenancy_id, table_name, entity_id, data)
    VALUES (OLD.tenancy_id, TG_TABLE_NAME, OLD.id, to_jsonb(OLD));
    RETURN OLD;
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION extdb_sync_mark_owner() RETURNS TRIGGER AS $$
BEGIN
    IF TG_OP = 'UPDATE' AND NEW.sequence_id IS DISTINCT FROM OLD.sequence_id THEN
        RETURN NULL;
    END IF;
    IF TG_OP IN ('UPDATE', 'DELETE') THEN
        UPDATE project_users SET should_update_sequence_id = TRUE
        WHERE tenancy_id = OLD.tenancy_id AND id = OLD.user_id;
    END IF;
    IF TG_OP IN ('INSERT', 'UPDATE') THEN
        UPDATE project_users SET should_update_sequence_id = TRUE
        WHERE tenancy_id = NEW.tenancy_id AND id = NEW.user_id;
    END IF;
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;
";

const TRIGGERS: &str = "
DROP TRIGGER IF EXISTS extdb_sync_mark ON project_users;
CREATE TRIGGER extdb_sync_mark BEFORE INSERT OR UPDATE ON project_users
    FOR EACH ROW EXECUTE FUNCTION extdb_sync_mark_row();
DROP TRIGGER IF EXISTS extdb_sync_delete ON project_users;
CREATE TRIGGER extdb_sync_delete AFTER DELETE ON project_users
    FOR EACH ROW EXECUTE FUNCTION extdb_sync_record_delete();

DROP TRIGGER IF EXISTS extdb_sync_mark ON contact_channels;
CREATE TRIGGER extdb_sync_mark BEFORE INSERT OR UPDATE ON contact_channels
    FOR EACH ROW EXECUTE FUNCTION extdb_sync_mark_row();
DROP TRIGGER IF EXISTS extdb_sync_delete ON contact_channels;
CREATE TRIGGER extdb_sync_delete AFTER DELETE ON contact_channels
    FOR EACH ROW EXECUTE FUNCTION extdb_sync_record_delete();
DROP TRIGGER IF EXISTS extdb_sync_owner ON contact_channels;
CREATE TRIGGER extdb_sync_owner AFTER INSERT OR UPDATE OR DELETE ON contact_channels
    FOR EACH ROW EXECUTE FUNCTION extdb_sync_mark_owner();
";

/// Install tables, tracking columns, functions and triggers.
pub async fn init_source_schema(store: &InternalStore) -> Result<()> {
    let mut client = store.client().await?.write().await;
    let tx = client.transaction().await?;

    // Serialize concurrent bootstraps; trigger DDL is not safe to race.
    tx.batch_execute("SELECT pg_advisory_xact_lock(hashtext('extdb_sync_init_source'))")
        .await?;
    for (step, sql) in [
        ("tables", TABLES),
        ("tracking columns", TRACKING_COLUMNS),
        ("trigger functions", TRIGGER_FUNCTIONS),
        ("triggers", TRIGGERS),
    ] {
        tx.batch_execute(sql)
            .await
            .with_context(|| format!("Failed to install {step}"))?;
    }
    tx.commit().await?;

    info!("Internal store change tracking installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_mapping_roundtrip() {
        for mapping in MappingName::ALL {
            assert_eq!(mapping_for_table(source_table(mapping)), Some(mapping));
        }
        assert_eq!(mapping_for_table(TOMBSTONE_TABLE), None);
    }

    #[test]
    fn test_sequencer_update_does_not_remark() {
        assert!(TRIGGER_FUNCTIONS
            .contains("IF TG_OP = 'UPDATE' AND NEW.sequence_id IS DISTINCT FROM OLD.sequence_id"));
    }

    #[test]
    fn test_every_tracked_table_has_triggers() {
        for mapping in MappingName::ALL {
            let table = source_table(mapping);
            assert!(TRIGGERS.contains(&format!("BEFORE INSERT OR UPDATE ON {table}")));
            assert!(TRIGGERS.contains(&format!("AFTER DELETE ON {table}")));
            assert!(TRACKING_COLUMNS.contains(&format!("ALTER TABLE {table}")));
        }
    }
}
