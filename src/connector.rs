//! Target sink construction, dispatched on target kind.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clickhouse_sink::ClickHouseSink;
use postgres_sink::PostgresSink;
use sync_core::TargetKind;
use target_sink::TargetSink;

use crate::registry::ResolvedTarget;

/// Upper bound on establishing a target connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Opens a sink for a resolved target.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    async fn connect(&self, target: &ResolvedTarget) -> Result<Box<dyn TargetSink>>;
}

/// Connects to real PostgreSQL and ClickHouse targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindConnector;

#[async_trait]
impl TargetConnector for KindConnector {
    async fn connect(&self, target: &ResolvedTarget) -> Result<Box<dyn TargetSink>> {
        let connect = async {
            let sink: Box<dyn TargetSink> = match target.kind {
                TargetKind::Postgres => {
                    Box::new(PostgresSink::connect(&target.name, &target.connection).await?)
                }
                TargetKind::ClickHouse => {
                    Box::new(ClickHouseSink::connect(&target.name, &target.connection).await?)
                }
            };
            anyhow::Ok(sink)
        };

        tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .with_context(|| {
                format!(
                    "Timed out connecting to {} target '{}'",
                    target.kind, target.name
                )
            })?
    }
}
