//! Command-line interface for extdb-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # Install triggers, tombstones and counters in the internal store
//! extdb-sync init-source --internal-database-url postgres://app@localhost/stack
//!
//! # Sequence pending mutations, then export them to every target
//! extdb-sync sequencer
//! extdb-sync poller --tenancy-id 6f1c...
//!
//! # Incident response
//! extdb-sync fusebox set --poller-enabled false
//!
//! # Admin API for the external scheduler
//! extdb-sync serve --config extdb-sync.toml
//! ```
//!
//! Reports are printed as JSON on stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use extdb_sync::config::{Settings, SettingsArgs};
use extdb_sync::fusebox::{update_flags, FuseboxStore, FuseboxUpdate};
use extdb_sync::{server, Engine};
use extdb_sync_internal_source::{init_source_schema, InternalStore, SourceOpts};
use serde::Serialize;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "extdb-sync")]
#[command(about = "Mirror tenant user data into customer-owned PostgreSQL and ClickHouse databases")]
#[command(long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the admin API
    Serve,

    /// Stamp pending mutations with sequence numbers
    Sequencer {
        /// Repeat passes until nothing is pending or max_duration elapses
        #[arg(long)]
        drain: bool,
    },

    /// Export sequenced changes to every target
    Poller {
        /// Only sync this tenancy
        #[arg(long)]
        tenancy_id: Option<Uuid>,
    },

    /// Read or set the fusebox
    Fusebox {
        #[command(subcommand)]
        command: FuseboxCommand,
    },

    /// Replication status of a tenancy's targets
    Status {
        #[arg(long)]
        tenancy_id: Uuid,
    },

    /// Install change tracking in the internal store
    InitSource,
}

#[derive(Subcommand)]
enum FuseboxCommand {
    /// Print the current flags
    Get,

    /// Update one or both flags
    Set {
        #[arg(long)]
        sequencer_enabled: Option<bool>,
        #[arg(long)]
        poller_enabled: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.settings)?;
    tracing::debug!("Loaded settings: {settings:?}");

    match cli.command {
        Commands::Serve => {
            let engine = Engine::connect(&settings).await?;
            server::serve(engine, &settings).await?;
        }
        Commands::Sequencer { drain } => {
            let engine = Engine::connect(&settings).await?;
            let max_duration = drain.then_some(settings.max_duration);
            print_json(&engine.run_sequencer(max_duration).await?)?;
        }
        Commands::Poller { tenancy_id } => {
            let engine = Engine::connect(&settings).await?;
            let report = match tenancy_id {
                Some(id) => engine.run_poller_for(id).await?,
                None => engine.run_poller().await?,
            };
            print_json(&report)?;
        }
        Commands::Fusebox { command } => {
            let engine = Engine::connect(&settings).await?;
            let flags = match command {
                FuseboxCommand::Get => engine.fusebox().read_flags().await?,
                FuseboxCommand::Set {
                    sequencer_enabled,
                    poller_enabled,
                } => {
                    update_flags(
                        engine.fusebox(),
                        FuseboxUpdate {
                            sequencer_enabled,
                            poller_enabled,
                        },
                    )
                    .await?
                }
            };
            print_json(&flags)?;
        }
        Commands::Status { tenancy_id } => {
            let engine = Engine::connect(&settings).await?;
            let status = engine
                .tenancy_status(tenancy_id)
                .await?
                .with_context(|| format!("Tenancy {tenancy_id} not found"))?;
            print_json(&status)?;
        }
        Commands::InitSource => {
            let store = InternalStore::connect(&SourceOpts {
                source_uri: settings.require_internal_database_url()?.to_string(),
            })
            .await?;
            init_source_schema(&store).await?;
            print_json(&serde_json::json!({ "ok": true }))?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
