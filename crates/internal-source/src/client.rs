//! PostgreSQL client utilities
//!
//! This module provides utilities for creating and managing the internal
//! store connection.

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls};

use crate::SourceOpts;

/// Create a new PostgreSQL client with connection handling
pub async fn new_postgresql_client(connection_string: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .context("Failed to connect to the internal database")?;

    // Spawn connection handler
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    Ok(client)
}

/// Handle to the internal store.
///
/// Reads share the connection (tokio-postgres pipelines concurrent queries);
/// transactions take it exclusively. A connection closed by the server is
/// replaced on the next access.
#[derive(Clone)]
pub struct InternalStore {
    client: Arc<RwLock<Client>>,
    connection_string: Arc<str>,
}

impl InternalStore {
    pub async fn connect(opts: &SourceOpts) -> Result<Self> {
        let client = new_postgresql_client(&opts.source_uri).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            connection_string: Arc::from(opts.source_uri.as_str()),
        })
    }

    pub(crate) async fn client(&self) -> Result<&RwLock<Client>> {
        if self.client.read().await.is_closed() {
            let mut client = self.client.write().await;
            // Another caller may have reconnected while we waited.
            if client.is_closed() {
                warn!("Internal database connection closed, reconnecting");
                *client = new_postgresql_client(&self.connection_string).await?;
                info!("Reconnected to the internal database");
            }
        }
        Ok(&self.client)
    }
}
