//! Persisted kill switches for the sequencer and the poller.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::InternalStore;

/// Global enable flags. Both default to on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseboxFlags {
    pub sequencer_enabled: bool,
    pub poller_enabled: bool,
}

impl Default for FuseboxFlags {
    fn default() -> Self {
        Self {
            sequencer_enabled: true,
            poller_enabled: true,
        }
    }
}

const READ_SQL: &str =
    "SELECT sequencer_enabled, poller_enabled FROM external_db_sync_fusebox WHERE id";

const WRITE_SQL: &str = "INSERT INTO external_db_sync_fusebox (id, sequencer_enabled, poller_enabled, updated_at) VALUES (TRUE, $1, $2, now()) ON CONFLICT (id) DO UPDATE SET sequencer_enabled = EXCLUDED.sequencer_enabled, poller_enabled = EXCLUDED.poller_enabled, updated_at = now()";

impl InternalStore {
    /// Current flags; a missing row reads as everything enabled.
    pub async fn read_fusebox(&self) -> Result<FuseboxFlags> {
        let client = self.client().await?.read().await;
        let row = client
            .query_opt(READ_SQL, &[])
            .await
            .context("Failed to read fusebox")?;
        Ok(row
            .map(|row| FuseboxFlags {
                sequencer_enabled: row.get(0),
                poller_enabled: row.get(1),
            })
            .unwrap_or_default())
    }

    pub async fn write_fusebox(&self, flags: FuseboxFlags) -> Result<()> {
        let client = self.client().await?.read().await;
        client
            .execute(WRITE_SQL, &[&flags.sequencer_enabled, &flags.poller_enabled])
            .await
            .context("Failed to write fusebox")?;
        info!(
            "Fusebox updated: sequencer_enabled={}, poller_enabled={}",
            flags.sequencer_enabled, flags.poller_enabled
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_everything() {
        let flags = FuseboxFlags::default();
        assert!(flags.sequencer_enabled);
        assert!(flags.poller_enabled);
    }

    #[test]
    fn test_flags_json_shape() {
        let flags: FuseboxFlags =
            serde_json::from_str(r#"{"sequencer_enabled":false,"poller_enabled":true}"#).unwrap();
        assert!(!flags.sequencer_enabled);
        assert!(flags.poller_enabled);
    }
}
