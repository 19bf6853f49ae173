//! Prometheus metrics helpers for the Lattice indexer.
//!
//! Metrics are recorded through the `metrics` facade anywhere in the
//! workspace; binaries install the Prometheus recorder once and expose it
//! over HTTP.
//!
//! ```rust,ignore
//! use lattice_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics()?;
//! start_metrics_server(9091, handle).await?;
//! ```
//!
//! # Naming
//!
//! - Prefix: component (`firehose_`, `pipeline_`, `saga_`, `deadletter_`, `cursor_`, `admin_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: bounded sets only (record kind, stage, reason)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Fails if a recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_common_metrics();
    Ok(handle)
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    init_metrics().ok()
}

/// Serve `/metrics` on the given port from a background task.
///
/// The listener is bound before returning, so a port conflict is reported
/// to the caller instead of killing the background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

fn register_common_metrics() {
    // =========================================================================
    // Firehose
    // =========================================================================

    describe_counter!(
        "firehose_frames_received_total",
        "Raw frames received from the relay"
    );
    describe_counter!(
        "firehose_frames_filtered_total",
        "Frames discarded as out of interest (label: reason)"
    );
    describe_counter!(
        "firehose_frames_invalid_total",
        "Frames rejected as structurally invalid (label: field)"
    );
    describe_counter!(
        "firehose_reconnect_attempts_total",
        "Connection attempts that failed or dropped"
    );
    describe_gauge!(
        "firehose_connected",
        "Whether the relay stream is connected (1=yes, 0=no)"
    );
    describe_gauge!(
        "firehose_outage_seconds",
        "Seconds since the relay stream was last connected (0 while connected)"
    );
    describe_gauge!(
        "firehose_backoff_seconds",
        "Current reconnection backoff delay"
    );

    // =========================================================================
    // Pipeline
    // =========================================================================

    describe_gauge!("pipeline_queue_depth", "Frames waiting in the event queue");
    describe_counter!(
        "pipeline_frames_indexed_total",
        "Frames fully applied to all stores (labels: kind, operation)"
    );
    describe_counter!(
        "pipeline_frames_retried_total",
        "Retry attempts after a retryable failure"
    );
    describe_counter!(
        "pipeline_frames_stale_total",
        "Create/update frames skipped because a newer version is indexed"
    );
    describe_counter!(
        "pipeline_frames_unhandled_total",
        "In-interest frames with no registered handler (label: collection)"
    );
    describe_counter!(
        "pipeline_frames_rejected_total",
        "Frames whose record payload failed to decode (label: kind)"
    );
    describe_histogram!(
        "pipeline_frame_duration_seconds",
        "Time to process one frame including retries"
    );

    // =========================================================================
    // Saga
    // =========================================================================

    describe_counter!(
        "saga_stage_failures_total",
        "Store stage failures inside the indexing saga (label: stage)"
    );
    describe_counter!(
        "saga_compensations_total",
        "Compensating deletes executed (labels: stage, result)"
    );
    describe_counter!(
        "saga_delete_failures_total",
        "Per-store failures during best-effort deletes (label: stage)"
    );

    // =========================================================================
    // Dead letters / cursor
    // =========================================================================

    describe_counter!(
        "deadletter_entries_total",
        "Frames moved to the dead-letter store (label: classification)"
    );
    describe_counter!(
        "deadletter_requeued_total",
        "Dead-letter requeue attempts (label: result)"
    );
    describe_counter!(
        "deadletter_sweeps_total",
        "Periodic dead-letter sweeps completed by the daemon"
    );
    describe_counter!(
        "admin_requests_total",
        "Admin API requests (labels: route, result)"
    );
    describe_gauge!("deadletter_backlog", "Entries in the dead-letter store");
    describe_gauge!("cursor_sequence", "Last checkpointed sequence number");
    describe_gauge!(
        "cursor_lag",
        "Highest received sequence minus the checkpointed sequence"
    );
}

/// Increment a counter.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Increment a counter carrying a single label.
#[inline]
pub fn increment_labeled(name: &'static str, label: &'static str, value: &'static str) {
    metrics::counter!(name, label => value).increment(1);
}

/// Set a gauge value.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}
