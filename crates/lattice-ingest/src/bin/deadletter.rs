//! Dead-letter operator tool.
//!
//! Inspects and requeues frames that the ingestion daemon could not index.
//!
//! # Usage
//!
//! ```bash
//! # List the oldest entries
//! lattice-deadletter list --limit 20
//!
//! # Show one entry as JSON
//! lattice-deadletter show 42
//!
//! # Requeue through the running daemon
//! lattice-deadletter --daemon http://127.0.0.1:9091 requeue 42
//! lattice-deadletter --daemon http://127.0.0.1:9091 sweep --limit 100
//!
//! # Requeue with the daemon stopped
//! lattice-deadletter requeue 42
//!
//! # Drop an entry without reprocessing it
//! lattice-deadletter purge 42
//! ```
//!
//! Without `--daemon`, `requeue` and `sweep` open the stores themselves, and
//! RocksDB and Tantivy lock them exclusively, so the daemon must be stopped.
//! The other commands only touch the state database and are safe to run
//! alongside it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lattice_ingest::store::Stores;
use lattice_ingest::{
    AdminClient, DeadLetterEntry, DeadLetterStore, Dispatcher, FrameProcessor, OutcomeResponse,
    ProcessorConfig, SweepReport,
};
use tracing_subscriber::EnvFilter;

/// Dead-letter operator tool.
#[derive(Parser, Debug)]
#[command(name = "lattice-deadletter")]
#[command(about = "Inspect and requeue dead-lettered firehose frames")]
#[command(version)]
struct Args {
    /// Directory holding the state database and the stores
    #[arg(long, env = "LATTICE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Admin API of a running daemon; requeue and sweep go through it when set
    #[arg(long, env = "LATTICE_ADMIN_URL")]
    daemon: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List entries, oldest first
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Print one entry as JSON
    Show { id: i64 },
    /// Reprocess one entry
    Requeue { id: i64 },
    /// Reprocess up to `limit` of the oldest entries
    Sweep {
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Delete an entry without reprocessing it
    Purge { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let state_db = args.data_dir.join("state.db");
    if !state_db.exists() {
        anyhow::bail!("State database not found: {}", state_db.display());
    }
    let dead_letters = Arc::new(
        DeadLetterStore::open(&state_db)
            .with_context(|| format!("Failed to open {}", state_db.display()))?,
    );

    match args.command {
        Command::List { limit, offset } => {
            let entries = dead_letters.list_entries(limit, offset)?;
            println!("{} entries total", dead_letters.count()?);
            for entry in &entries {
                print_summary(entry);
            }
        }
        Command::Show { id } => {
            let entry = dead_letters
                .get(id)?
                .with_context(|| format!("No dead-letter entry {id}"))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Command::Requeue { id } => {
            let outcome: OutcomeResponse = match &args.daemon {
                Some(url) => AdminClient::new(url)?.requeue(id).await?,
                None => open_processor(&args.data_dir, dead_letters)?
                    .requeue(id)?
                    .into(),
            };
            if !outcome.applied {
                anyhow::bail!("Entry {id} failed again: {}", outcome.detail);
            }
            println!("Entry {id} applied: {}", outcome.detail);
        }
        Command::Sweep { limit } => {
            let report: SweepReport = match &args.daemon {
                Some(url) => AdminClient::new(url)?.sweep(limit).await?,
                None => open_processor(&args.data_dir, dead_letters)?.sweep(limit)?,
            };
            println!(
                "Requeued {}, still failing {}",
                report.requeued, report.still_failing
            );
        }
        Command::Purge { id } => {
            if dead_letters.remove(id)? {
                println!("Purged entry {id}");
            } else {
                anyhow::bail!("No dead-letter entry {id}");
            }
        }
    }

    Ok(())
}

fn open_processor(
    data_dir: &std::path::Path,
    dead_letters: Arc<DeadLetterStore>,
) -> Result<FrameProcessor> {
    let stores = Stores::open(data_dir).with_context(|| {
        format!(
            "Failed to open stores in {} (is the daemon running? pass --daemon)",
            data_dir.display()
        )
    })?;
    let dispatcher = Dispatcher::with_default_handlers(Arc::new(stores.saga()));
    Ok(FrameProcessor::new(
        Arc::new(dispatcher),
        dead_letters,
        ProcessorConfig::default(),
    ))
}

fn print_summary(entry: &DeadLetterEntry) {
    let last_failed = chrono::DateTime::from_timestamp(entry.last_failed_at, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| entry.last_failed_at.to_string());
    println!(
        "{:>6}  {}  {:<13} {:<7} retries={}  {}  {}",
        entry.id,
        last_failed,
        entry.classification.as_str(),
        entry.frame.operation.as_str(),
        entry.retry_count,
        entry.frame.entity_ref(),
        entry.error_label
    );
}
