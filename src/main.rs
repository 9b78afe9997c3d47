//! Command-line interface for trigger-sync
//!
//! Operational commands against the outgoing batch table.
//!
//! # Usage Examples
//!
//! ```bash
//! # Create the batch table and its indexes
//! trigger-sync init --config trigger-sync.toml
//!
//! # What node store-1 would receive on its next pull
//! trigger-sync pending --node store-1
//!
//! # Backlog and errors
//! trigger-sync count-unsent --node store-1
//! trigger-sync count-errors
//! trigger-sync errors --limit 20
//! trigger-sync summary
//!
//! # Recovery
//! trigger-sync reset-routing
//! trigger-sync mark-sent --node store-1
//! ```
//!
//! The store URL comes from `--store-url`, `TRIGGER_SYNC_STORE_URL` or the
//! `[store]` section of the config file, in that order.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use sync_core::BatchStatus;
use tracing::info;
use trigger_sync::outgoing_batch::{OutgoingBatchService, PostgresBatchStore};
use trigger_sync::AppConfig;

#[derive(Parser)]
#[command(name = "trigger-sync")]
#[command(about = "Inspect and maintain outgoing replication batches")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "TRIGGER_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL URL of the batch store; overrides the config file
    #[arg(long, global = true, env = "TRIGGER_SYNC_STORE_URL")]
    store_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the outgoing batch table if it does not exist
    Init,

    /// Show the batches the selector would hand to a node
    Pending {
        /// Target node id
        #[arg(long)]
        node: String,

        /// Also select batches on disabled channels
        #[arg(long)]
        include_disabled: bool,
    },

    /// Count batches flagged in error
    CountErrors,

    /// Count batches not yet acknowledged, optionally per channel for one node
    CountUnsent {
        /// Break the count down by channel for this node
        #[arg(long)]
        node: Option<String>,
    },

    /// Mark every pending batch of a node as sent
    MarkSent {
        /// Target node id
        #[arg(long)]
        node: String,
    },

    /// Return batches abandoned mid-routing to new
    ResetRouting,

    /// Batch counts and row totals by node and status
    Summary {
        /// Statuses to include (default: every pending status)
        #[arg(long = "status", value_name = "STATUS")]
        statuses: Vec<String>,
    },

    /// List batches in error
    Errors {
        /// Maximum number of batches to list
        #[arg(long, default_value = "100")]
        limit: usize,
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
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let url = cli
        .store_url
        .clone()
        .or_else(|| config.store.url.clone())
        .context("No batch store URL: pass --store-url, set TRIGGER_SYNC_STORE_URL or [store].url")?;

    let store = PostgresBatchStore::connect(&url, &config.store.table_prefix)
        .await
        .with_context(|| format!("Failed to connect to batch store at {url}"))?;

    if let Commands::Init = cli.command {
        store.initialize().await?;
        info!("Batch table {} is ready", store.table_name());
        return Ok(());
    }

    let service = config.batch_service(Arc::new(store))?;
    run_command(&service, cli.command).await
}

async fn run_command(service: &OutgoingBatchService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {}
        Commands::Pending {
            node,
            include_disabled,
        } => {
            let batches = service.get_outgoing_batches(&node, include_disabled).await?;
            if batches.is_empty() {
                println!("No batches pending for node {node}");
            }
            for batch in &batches {
                println!(
                    "{:>10}  {:<16} {}  rows={}  created={}",
                    batch.batch_id,
                    batch.channel_id,
                    batch.status,
                    batch.counters.data_row_count,
                    batch.create_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::CountErrors => {
            println!("{}", service.count_batches_in_error().await?);
        }
        Commands::CountUnsent { node: None } => {
            println!("{}", service.count_batches_unsent().await?);
        }
        Commands::CountUnsent { node: Some(node) } => {
            for backlog in service.count_unsent_by_channel(&node).await? {
                println!("{:<16} {}", backlog.channel_id, backlog.batch_count);
            }
        }
        Commands::MarkSent { node } => {
            let marked = service.mark_all_as_sent_for_node(&node).await?;
            info!("Marked {} batches as sent for node {}", marked, node);
        }
        Commands::ResetRouting => {
            let reset = service.update_abandoned_routing_batches().await?;
            info!("Reset {} abandoned routing batches", reset);
        }
        Commands::Summary { statuses } => {
            let statuses = if statuses.is_empty() {
                BatchStatus::PENDING.to_vec()
            } else {
                statuses
                    .iter()
                    .map(|s| s.parse::<BatchStatus>())
                    .collect::<Result<Vec<_>, _>>()?
            };
            for summary in service.summary(&statuses).await? {
                println!("{}", serde_json::to_string(&summary)?);
            }
        }
        Commands::Errors { limit } => {
            for batch in service.batch_errors(limit).await? {
                println!(
                    "{:>10}  node={} channel={} row={} state={} code={}  {}",
                    batch.batch_id,
                    batch.node_id,
                    batch.channel_id,
                    batch.failed_row_number,
                    batch.sql_state.as_deref().unwrap_or("-"),
                    batch.sql_code,
                    batch.sql_message.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}
