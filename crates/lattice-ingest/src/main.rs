//! Lattice ingestion daemon.
//!
//! Consumes the relay firehose and keeps the relational, search and graph
//! stores up to date.
//!
//! # Usage
//!
//! ```bash
//! # Run with default settings (public Jetstream, ./data)
//! lattice-ingest
//!
//! # Run against a private relay with custom paths
//! lattice-ingest \
//!     --endpoint wss://jetstream.internal/subscribe \
//!     --data-dir /var/lib/lattice \
//!     --lanes 8
//!
//! # Reindex single records through the running daemon
//! lattice-ingest --daemon http://127.0.0.1:9091 \
//!     --reindex at://did:plc:abc/pub.lattice.preprint/3l3qo2vuowo2b
//!
//! # Reindex with the daemon stopped (opens the stores directly)
//! lattice-ingest --reindex at://did:plc:abc/pub.lattice.preprint/3l3qo2vuowo2b
//! ```
//!
//! Every flag can also be set through the environment (see `--help`); a
//! `.env` file is loaded first when present.
//!
//! While running, the daemon serves the admin API (see
//! [`lattice_ingest::admin`]) on the loopback interface and sweeps the
//! dead-letter store periodically.
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) and SIGTERM for graceful shutdown:
//! 1. Stops reading from the relay
//! 2. Drains the event queue and finishes in-flight frames
//! 3. Persists the final cursor
//! 4. Stops the dead-letter sweeper and exits
//!
//! The drain and final checkpoint also run when the relay source fails.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lattice_core::metrics::{init_metrics, start_metrics_server};
use lattice_ingest::firehose::DEFAULT_ENDPOINT;
use lattice_ingest::store::Stores;
use lattice_ingest::{
    AdminClient, AdminState, CursorManager, DeadLetterStore, Dispatcher, EventFilter,
    FIREHOSE_CURSOR_KEY, FirehoseSource, FrameProcessor, HttpRecordFetcher, InterestSet,
    JetstreamTransport, OutcomeResponse, Pipeline, PipelineConfig, ProcessorConfig,
    ReconnectPolicy, ReindexConfig, Reindexer, SweepReport, SweeperConfig, TransportConfig,
    run_sweeper,
};
use metrics::gauge;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Lattice ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "lattice-ingest")]
#[command(about = "Firehose indexer for Lattice records")]
#[command(version)]
struct Args {
    /// Jetstream subscribe endpoint
    #[arg(long, env = "LATTICE_RELAY_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Collections to index (comma-separated, defaults to every Lattice record kind)
    #[arg(long, env = "LATTICE_COLLECTIONS", value_delimiter = ',')]
    collections: Option<Vec<String>>,

    /// Directory holding the state database and the three stores
    #[arg(long, env = "LATTICE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Number of worker lanes (default: CPU count, 2-16)
    #[arg(long, env = "LATTICE_LANES")]
    lanes: Option<usize>,

    /// Frames buffered between the relay and the lanes
    #[arg(long, env = "LATTICE_QUEUE_CAPACITY", default_value = "4096")]
    queue_capacity: usize,

    /// Frames buffered per lane
    #[arg(long, env = "LATTICE_LANE_CAPACITY", default_value = "256")]
    lane_capacity: usize,

    /// Maximum milliseconds between cursor checkpoints
    #[arg(long, env = "LATTICE_CHECKPOINT_INTERVAL_MS", default_value = "1000")]
    checkpoint_interval_ms: u64,

    /// Retries for a retryable failure before a frame is dead-lettered
    #[arg(long, env = "LATTICE_MAX_RETRIES", default_value = "3")]
    max_retries: u32,

    /// Delay before the first retry, in milliseconds (doubles per retry)
    #[arg(long, env = "LATTICE_RETRY_BACKOFF_MS", default_value = "200")]
    retry_backoff_ms: u64,

    /// Seconds without a message before the connection counts as lost
    #[arg(long, env = "LATTICE_IDLE_TIMEOUT_SECS", default_value = "60")]
    idle_timeout_secs: u64,

    /// Upper bound on the reconnection backoff, in seconds
    #[arg(long, env = "LATTICE_MAX_BACKOFF_SECS", default_value = "60")]
    max_backoff_secs: u64,

    /// PDS used to fetch records for reindexing
    #[arg(long, env = "LATTICE_ORIGIN", default_value = "https://bsky.social")]
    origin: String,

    /// Reindex these AT-URIs from their origin, then exit
    #[arg(long, num_args = 1..)]
    reindex: Vec<String>,

    /// Admin API of a running daemon; --reindex goes through it when set
    #[arg(long, env = "LATTICE_ADMIN_URL")]
    daemon: Option<String>,

    /// Admin API port on the loopback interface (0 to disable)
    #[arg(long, env = "LATTICE_ADMIN_PORT", default_value = "9091")]
    admin_port: u16,

    /// Seconds between automatic dead-letter sweeps (0 to disable)
    #[arg(
        long,
        env = "LATTICE_DEADLETTER_SWEEP_INTERVAL_SECS",
        default_value = "300"
    )]
    deadletter_sweep_interval_secs: u64,

    /// Dead-letter entries requeued per sweep
    #[arg(long, env = "LATTICE_DEADLETTER_SWEEP_LIMIT", default_value = "100")]
    deadletter_sweep_limit: usize,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "LATTICE_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before parsing so it can supply flag values
    let dotenv = std::env::var("DOTENV_PATH").unwrap_or_else(|_| ".env".to_string());
    if Path::new(&dotenv).exists() {
        dotenvy::from_path(&dotenv).with_context(|| format!("Failed to load {dotenv}"))?;
    }

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lattice_ingest=debug")),
        )
        .init();

    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let args = Args::parse();

    tracing::info!("Lattice ingestion daemon starting...");

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .with_context(|| format!("Failed to bind metrics port {}", args.metrics_port))?;
        gauge!("ingestion_running").set(1.0);
    }

    let interest = match &args.collections {
        Some(collections) => InterestSet::new(collections.iter().map(|c| c.trim().to_string())),
        None => InterestSet::all_kinds(),
    };

    if !args.reindex.is_empty() {
        let target = match &args.daemon {
            Some(url) => ReindexTarget::Daemon(AdminClient::new(url)?),
            None => ReindexTarget::Local(Reindexer::new(
                record_fetcher(&args)?,
                init_processor(&args)?,
            )),
        };
        return run_reindex(&args.reindex, &target).await;
    }

    let processor = init_processor(&args)?;

    // Set up graceful shutdown
    let (stop_tx, stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        let _ = stop_tx.send(true);
    })
    .context("Failed to set Ctrl+C handler")?;

    let state_db = args.data_dir.join("state.db");
    let cursor = Arc::new(
        CursorManager::open(&state_db, FIREHOSE_CURSOR_KEY)
            .with_context(|| format!("Failed to open cursor at {}", state_db.display()))?,
    );
    let resume = cursor.load()?;

    let mut pipeline_config = PipelineConfig {
        queue_capacity: args.queue_capacity,
        lane_capacity: args.lane_capacity,
        checkpoint_interval: Duration::from_millis(args.checkpoint_interval_ms),
        ..Default::default()
    };
    if let Some(lanes) = args.lanes {
        pipeline_config.lanes = lanes;
    }

    let transport_config = TransportConfig {
        endpoint: args.endpoint.clone(),
        collections: interest.collections().map(str::to_string).collect(),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        ..Default::default()
    };
    let policy = ReconnectPolicy {
        max_backoff: Duration::from_secs(args.max_backoff_secs.max(1)),
        ..Default::default()
    };

    tracing::info!("Configuration:");
    tracing::info!("  Endpoint: {}", transport_config.endpoint);
    tracing::info!("  Collections: {}", transport_config.collections.join(", "));
    tracing::info!("  Data dir: {}", args.data_dir.display());
    tracing::info!("  Lanes: {}", pipeline_config.lanes);
    tracing::info!("  Max retries: {}", args.max_retries);
    tracing::info!(
        "  Dead-letter sweep: every {}s, {} entries",
        args.deadletter_sweep_interval_secs,
        args.deadletter_sweep_limit
    );
    tracing::info!("  Resume cursor: {:?}", resume);

    if args.admin_port > 0 {
        let state = AdminState {
            processor: Arc::clone(&processor),
            reindexer: Arc::new(Reindexer::new(record_fetcher(&args)?, Arc::clone(&processor))),
        };
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, args.admin_port));
        lattice_ingest::admin::start_admin_server(addr, state)
            .await
            .with_context(|| format!("Failed to bind admin port {}", args.admin_port))?;
    }

    let (sweep_stop_tx, sweep_stop_rx) = watch::channel(false);
    let sweeper = tokio::spawn(run_sweeper(
        Arc::clone(&processor),
        SweeperConfig {
            interval: Duration::from_secs(args.deadletter_sweep_interval_secs),
            limit: args.deadletter_sweep_limit,
        },
        sweep_stop_rx,
    ));

    let pipeline = Pipeline::new(pipeline_config, processor, Arc::clone(&cursor));
    let (sink, handle) = pipeline.start().context("Failed to start pipeline")?;

    let source = FirehoseSource::new(
        JetstreamTransport::new(transport_config),
        EventFilter::new(interest),
        policy,
    );

    tracing::info!("Starting live ingestion...");
    let source_task = tokio::spawn(source.run(sink, stop_rx));
    let (source_result, pipeline_result) = handle
        .join_after(async move {
            source_task
                .await
                .map_err(|e| lattice_ingest::Error::Task(format!("firehose task panicked: {e}")))
                .and_then(|result| result)
        })
        .await;

    // Shutdown sequence
    let _ = sweep_stop_tx.send(true);
    let swept = sweeper.await.unwrap_or_else(|e| {
        tracing::error!("Dead-letter sweeper panicked: {}", e);
        SweepReport::default()
    });

    let pipeline_stats = pipeline_result.context("Pipeline shutdown failed")?;
    let source_stats = source_result.context("Firehose source failed")?;

    gauge!("ingestion_running").set(0.0);

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Frames received:      {}", source_stats.received);
    tracing::info!("Commits submitted:    {}", source_stats.submitted);
    tracing::info!("Frames rejected:      {}", source_stats.rejected);
    tracing::info!("Frames processed:     {}", pipeline_stats.processed);
    tracing::info!("Connections:          {}", source_stats.connections);
    tracing::info!("Dead letters requeued: {}", swept.requeued);
    tracing::info!("Final cursor:         {:?}", pipeline_stats.final_cursor);

    Ok(())
}

/// Open the stores and build the frame processor.
fn init_processor(args: &Args) -> Result<Arc<FrameProcessor>> {
    let stores = Stores::open(&args.data_dir)
        .with_context(|| format!("Failed to open stores in {}", args.data_dir.display()))?;

    tracing::info!(
        "Stores opened: {} relational rows, {} search documents, ~{} graph keys",
        stores.relational.count()?,
        stores.search.num_docs(),
        stores.graph.approximate_keys()
    );

    let state_db = args.data_dir.join("state.db");
    let dead_letters = Arc::new(
        DeadLetterStore::open(&state_db)
            .with_context(|| format!("Failed to open dead letters at {}", state_db.display()))?,
    );
    let backlog = dead_letters.count()?;
    if backlog > 0 {
        tracing::warn!("{} dead-lettered frames awaiting requeue", backlog);
    }

    let dispatcher = Dispatcher::with_default_handlers(Arc::new(stores.saga()));
    let config = ProcessorConfig {
        max_retries: args.max_retries,
        retry_backoff: Duration::from_millis(args.retry_backoff_ms),
        ..Default::default()
    };

    Ok(Arc::new(FrameProcessor::new(
        Arc::new(dispatcher),
        dead_letters,
        config,
    )))
}

fn record_fetcher(args: &Args) -> Result<HttpRecordFetcher> {
    Ok(HttpRecordFetcher::new(ReindexConfig {
        origin: args.origin.clone(),
        ..Default::default()
    })?)
}

/// Where `--reindex` sends its requests.
enum ReindexTarget {
    /// Stores opened by this process; the daemon must be stopped.
    Local(Reindexer<HttpRecordFetcher>),
    /// A running daemon's admin API.
    Daemon(AdminClient),
}

impl ReindexTarget {
    async fn reindex(&self, uri: &str) -> lattice_ingest::Result<OutcomeResponse> {
        match self {
            Self::Local(reindexer) => reindexer.reindex(uri).await.map(OutcomeResponse::from),
            Self::Daemon(client) => client.reindex(uri).await,
        }
    }
}

/// Reindex the requested URIs and report each outcome.
async fn run_reindex(uris: &[String], target: &ReindexTarget) -> Result<()> {
    let mut failures = 0;
    for uri in uris {
        match target.reindex(uri).await {
            Ok(outcome) if outcome.applied => {
                tracing::info!("{}: {}", uri, outcome.detail);
            }
            Ok(outcome) => {
                failures += 1;
                tracing::error!(
                    "{}: dead-lettered as entry {:?}: {}",
                    uri,
                    outcome.dead_letter_id,
                    outcome.detail
                );
            }
            Err(e) => {
                failures += 1;
                tracing::error!("{}: {}", uri, e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} records failed to reindex", failures, uris.len());
    }
    Ok(())
}
