//! Fusebox: persisted kill switches for the sequencer and the poller.
//!
//! A disabled component's run returns success immediately without touching
//! any data.

use anyhow::Result;
use async_trait::async_trait;
use extdb_sync_internal_source::InternalStore;
use serde::{Deserialize, Serialize};

pub use extdb_sync_internal_source::FuseboxFlags;

#[async_trait]
pub trait FuseboxStore: Send + Sync {
    async fn read_flags(&self) -> Result<FuseboxFlags>;

    /// Persist `flags` and return the stored value.
    async fn write_flags(&self, flags: FuseboxFlags) -> Result<FuseboxFlags>;
}

/// Partial update of the fusebox; absent flags keep their stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FuseboxUpdate {
    #[serde(default)]
    pub sequencer_enabled: Option<bool>,
    #[serde(default)]
    pub poller_enabled: Option<bool>,
}

impl FuseboxUpdate {
    pub fn apply(&self, current: FuseboxFlags) -> FuseboxFlags {
        FuseboxFlags {
            sequencer_enabled: self.sequencer_enabled.unwrap_or(current.sequencer_enabled),
            poller_enabled: self.poller_enabled.unwrap_or(current.poller_enabled),
        }
    }
}

/// Read, update and persist the flags.
pub async fn update_flags(store: &dyn FuseboxStore, update: FuseboxUpdate) -> Result<FuseboxFlags> {
    let current = store.read_flags().await?;
    let next = update.apply(current);
    if next == current {
        return Ok(current);
    }
    store.write_flags(next).await
}

#[async_trait]
impl FuseboxStore for InternalStore {
    async fn read_flags(&self) -> Result<FuseboxFlags> {
        self.read_fusebox().await
    }

    async fn write_flags(&self, flags: FuseboxFlags) -> Result<FuseboxFlags> {
        self.write_fusebox(flags).await?;
        self.read_fusebox().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_keeps_absent_flags() {
        let current = FuseboxFlags {
            sequencer_enabled: false,
            poller_enabled: true,
        };
        let update = FuseboxUpdate {
            poller_enabled: Some(false),
            ..Default::default()
        };
        assert_eq!(
            update.apply(current),
            FuseboxFlags {
                sequencer_enabled: false,
                poller_enabled: false,
            }
        );
        assert_eq!(FuseboxUpdate::default().apply(current), current);
    }

    #[test]
    fn test_update_rejects_unknown_fields() {
        assert!(serde_json::from_str::<FuseboxUpdate>(r#"{"sequencerEnabled":true}"#).is_err());
        let update: FuseboxUpdate = serde_json::from_str(r#"{"sequencer_enabled":true}"#).unwrap();
        assert_eq!(update.sequencer_enabled, Some(true));
        assert_eq!(update.poller_enabled, None);
    }
}
