//! Periodic dead-letter sweep inside the daemon.
//!
//! Requeues the oldest dead-lettered frames through the shared
//! [`FrameProcessor`] on a fixed interval, so transient outages heal without
//! an operator. An empty backlog skips the sweep entirely.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use super::processor::{FrameProcessor, SweepReport};

/// Sweep schedule.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Entries requeued per sweep, oldest first.
    pub limit: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            limit: 100,
        }
    }
}

/// Sweep every `config.interval` until `shutdown` turns true (or its sender
/// is dropped). Returns the totals across all sweeps.
pub async fn run_sweeper(
    processor: Arc<FrameProcessor>,
    config: SweeperConfig,
    mut shutdown: watch::Receiver<bool>,
) -> SweepReport {
    let mut totals = SweepReport::default();
    if config.interval.is_zero() {
        return totals;
    }

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; the first sweep waits one interval.
    ticker.tick().await;

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let processor = Arc::clone(&processor);
        let limit = config.limit;
        let swept = tokio::task::spawn_blocking(move || -> crate::Result<SweepReport> {
            if processor.dead_letters().count()? == 0 {
                return Ok(SweepReport::default());
            }
            processor.sweep(limit)
        })
        .await;

        match swept {
            Ok(Ok(report)) => {
                counter!("deadletter_sweeps_total").increment(1);
                debug!(
                    "Sweep finished: {} requeued, {} still failing",
                    report.requeued, report.still_failing
                );
                totals.requeued += report.requeued;
                totals.still_failing += report.still_failing;
            }
            Ok(Err(e)) => warn!("Dead-letter sweep failed: {}", e),
            Err(e) => error!("Dead-letter sweep task panicked: {}", e),
        }
    }

    totals
}
