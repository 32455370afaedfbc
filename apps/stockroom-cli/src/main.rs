//! # Stockroom CLI
//!
//! Operator commands over the offline mutation queue.
//!
//! ## Usage
//! ```text
//! stockroom status                      queue counts and connectivity
//! stockroom flush                       replay pending mutations now
//! stockroom list [--status failed]      queued entries
//! stockroom conflicts                   entries waiting for a decision
//! stockroom resolve <id> merge --data '{"qty": 3}'
//! stockroom retry <id> | --all          failed entries back to pending
//! stockroom discard <id>
//! stockroom clear --yes                 wipe the queue
//! stockroom watch                       background sync until Ctrl+C
//! ```
//!
//! Only `flush` and `watch` return interrupted (`in_flight`) entries to the
//! queue; do not run them while another worker is replaying the same queue.
//!
//! Configuration comes from `sync.toml` in the platform config directory
//! (or `--config`), overlaid by `STOCKROOM_*` environment variables.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stockroom_core::{ConflictChoice, MutationStatus, QueuedMutation, Record};
use stockroom_sync::{OfflineCoordinator, SyncConfig};

#[derive(Parser)]
#[command(name = "stockroom")]
#[command(about = "Inspect and drive the Stockroom offline sync queue")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to sync.toml (platform config directory when omitted)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue counts and connectivity
    Status,
    /// Replay pending mutations now
    Flush,
    /// List queued mutations
    List {
        /// Only entries with this status (pending, in_flight, failed, conflict)
        #[arg(long)]
        status: Option<MutationStatus>,
    },
    /// List conflicts waiting for a decision
    Conflicts,
    /// Resolve a conflict
    Resolve {
        /// Mutation id
        id: String,
        /// local, server or merge
        choice: ConflictChoice,
        /// JSON object with a value per conflicting field (merge only)
        #[arg(long, value_name = "JSON")]
        data: Option<String>,
    },
    /// Put failed mutations back in the queue
    Retry {
        /// Mutation id
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<String>,
        /// Retry every failed mutation
        #[arg(long)]
        all: bool,
    },
    /// Drop one mutation without sending it
    Discard {
        /// Mutation id
        id: String,
    },
    /// Delete every queued mutation and conflict
    Clear {
        /// Confirm the irreversible wipe
        #[arg(long)]
        yes: bool,
    },
    /// Run background sync until interrupted
    Watch,
}

impl Commands {
    fn replays_queue(&self) -> bool {
        matches!(self, Commands::Flush | Commands::Watch)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config =
        SyncConfig::load(cli.config.clone()).context("Failed to load configuration")?;
    // Only `watch` runs the orchestrator
    config.background.enabled = matches!(cli.command, Commands::Watch);

    let coordinator = OfflineCoordinator::open(config)
        .await
        .context("Failed to open the offline queue")?;
    // Crash recovery belongs to the process that replays the queue
    if cli.command.replays_queue() {
        coordinator.init().await?;
    } else {
        coordinator.attach().await?;
    }

    let result = run(&cli, &coordinator).await;
    coordinator.dispose().await?;
    result
}

async fn run(cli: &Cli, coordinator: &OfflineCoordinator) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Status => {
            let status = coordinator.sync_status().await?;
            if cli.json {
                return print_json(&status);
            }
            println!(
                "online: {}{}",
                status.is_online,
                if status.is_slow_connection { " (slow)" } else { "" }
            );
            println!("pending: {}", status.pending_count);
            println!("in flight: {}", status.in_flight_count);
            println!("failed: {}", status.failed_count);
            println!("conflicts: {}", status.conflict_count);
            match status.last_sync_at {
                Some(at) => println!("last sync: {}", at.to_rfc3339()),
                None => println!("last sync: never"),
            }
        }

        Commands::Flush => match coordinator.force_sync().await? {
            Some(summary) if cli.json => print_json(&summary)?,
            Some(summary) => println!(
                "succeeded {}, failed {}, conflicts {}, retried {}, deferred {}",
                summary.succeeded,
                summary.failed,
                summary.conflicts,
                summary.retried,
                summary.deferred
            ),
            None => println!("Nothing flushed (offline or a flush is already running)"),
        },

        Commands::List { status } => {
            let entries = coordinator.manager().list(*status).await?;
            if cli.json {
                return print_json(&entries);
            }
            if entries.is_empty() {
                println!("Queue is empty");
            }
            for entry in &entries {
                print_entry(entry);
            }
        }

        Commands::Conflicts => {
            let conflicts = coordinator.conflicts().await?;
            if cli.json {
                return print_json(&conflicts);
            }
            if conflicts.is_empty() {
                println!("No conflicts");
            }
            for conflict in &conflicts {
                println!(
                    "{}  {} {}/{}",
                    conflict.id,
                    conflict.operation_type,
                    conflict.table,
                    conflict.record_id.as_deref().unwrap_or("-")
                );
                for field in &conflict.conflicting_fields {
                    println!(
                        "    {}: original {} | local {} | server {}",
                        field.field,
                        display_value(field.original_value.as_ref()),
                        display_value(field.local_value.as_ref()),
                        display_value(field.server_value.as_ref())
                    );
                }
            }
        }

        Commands::Resolve { id, choice, data } => {
            let merged = data.as_deref().map(parse_record).transpose()?;
            let outcome = coordinator.resolve_conflict(id, *choice, merged).await?;
            info!(id = %id, ?outcome, "Conflict resolved");
            println!("{outcome:?}");
        }

        Commands::Retry { id, all } => {
            if *all {
                let count = coordinator.retry_all_failed().await?;
                println!("Requeued {count} failed mutation(s)");
            } else if let Some(id) = id {
                coordinator.retry_failed(id).await?;
                println!("Requeued {id}");
            }
        }

        Commands::Discard { id } => {
            coordinator.discard(id).await?;
            println!("Discarded {id}");
        }

        Commands::Clear { yes } => {
            if !yes {
                bail!("Refusing to clear offline data without --yes");
            }
            let removed = coordinator.clear_all_offline_data().await?;
            println!("Removed {removed} queued mutation(s)");
        }

        Commands::Watch => {
            info!("Background sync running, press Ctrl+C to stop");
            shutdown_signal().await;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_record(raw: &str) -> anyhow::Result<Record> {
    let value: serde_json::Value = serde_json::from_str(raw).context("--data is not valid JSON")?;
    match value {
        serde_json::Value::Object(record) => Ok(record),
        _ => bail!("--data must be a JSON object"),
    }
}

fn print_entry(entry: &QueuedMutation) {
    println!(
        "{}  #{} {:<9} {} {}/{}  attempts {}",
        entry.id,
        entry.seq,
        entry.status.as_str(),
        entry.operation_type,
        entry.table,
        entry.record_id.as_deref().unwrap_or("-"),
        entry.attempts
    );
    if let Some(error) = &entry.last_error {
        println!("    {error}");
    }
}

fn display_value(value: Option<&serde_json::Value>) -> String {
    value.map_or_else(|| "(absent)".to_string(), |v| v.to_string())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(?e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping background sync");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("stockroom").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_only_worker_commands_recover_interrupted_entries() {
        assert!(parse(&["flush"]).command.replays_queue());
        assert!(parse(&["watch"]).command.replays_queue());

        assert!(!parse(&["status"]).command.replays_queue());
        assert!(!parse(&["list", "--status", "in_flight"]).command.replays_queue());
        assert!(!parse(&["retry", "--all"]).command.replays_queue());
        assert!(!parse(&["clear", "--yes"]).command.replays_queue());
    }
}
