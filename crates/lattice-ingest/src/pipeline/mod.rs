//! Ingestion pipeline.
//!
//! ```text
//! ┌──────────────────┐  FrameSink   ┌────────────┐  dispatcher   ┌─────────────┐
//! │ firehose source  │─────────────►│ EventQueue │──────────────►│ worker lanes│
//! │ (tokio task)     │  track(seq)  │ (bounded)  │  thread       │ (N threads) │
//! └──────────────────┘              └────────────┘               └──────┬──────┘
//!                                                                      │ resolve(seq)
//!                                      ┌──────────────┐                ▼
//!                                      │ checkpointer │──flush──► CursorManager
//!                                      └──────────────┘
//! ```
//!
//! The source tracks every frame before it enters the queue; a lane
//! resolves it once the processor reaches a terminal outcome. The
//! checkpointer persists the cursor every `checkpoint_interval`, and the
//! final cursor is written after the lanes have drained.
//!
//! Shutdown starts by dropping every [`FrameSink`]: the queue closes, the
//! dispatcher thread forwards what is left and closes the lanes, the lanes
//! finish their in-flight frames, and [`PipelineHandle::join`] writes the
//! final checkpoint.

mod lanes;
mod processor;
mod queue;
mod sweeper;

pub use lanes::LanePool;
pub use processor::{FrameOutcome, FrameProcessor, ProcessorConfig, SweepReport};
pub use queue::{QueueReceiver, QueueSender, bounded};
pub use sweeper::{SweeperConfig, run_sweeper};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use lattice_core::CommitFrame;
use tracing::{error, info, warn};

use crate::cursor::CursorManager;
use crate::{Error, Result};

/// Pipeline sizing.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of worker lanes.
    pub lanes: usize,
    /// Frames buffered per lane.
    pub lane_capacity: usize,
    /// Frames buffered between the source and the dispatcher.
    pub queue_capacity: usize,
    /// Maximum time between cursor checkpoints.
    pub checkpoint_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lanes: num_cpus::get().clamp(2, 16),
            lane_capacity: 256,
            queue_capacity: 4096,
            checkpoint_interval: Duration::from_secs(1),
        }
    }
}

/// Producer handle given to the firehose source.
#[derive(Clone)]
pub struct FrameSink {
    queue: QueueSender,
    cursor: Arc<CursorManager>,
}

impl FrameSink {
    /// Track and enqueue a frame, waiting while the queue is full.
    pub async fn submit(&self, frame: CommitFrame) -> Result<()> {
        self.cursor.track(frame.seq);
        self.queue.enqueue(frame).await
    }

    /// Record a sequence that reached a terminal outcome without entering the
    /// queue (filtered or invalid).
    pub fn skip(&self, seq: u64) {
        self.cursor.observe(seq);
    }

    /// Highest sequence submitted or skipped so far. Replayed frames at or
    /// below it are already accounted for.
    pub fn highest_seen(&self) -> Option<u64> {
        self.cursor.highest_seen()
    }

    /// Flush the cursor and return the persisted value to resume from.
    pub fn resume_point(&self) -> Result<Option<u64>> {
        self.cursor.flush()?;
        self.cursor.load()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Counts reported when the pipeline stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames handed to the lanes.
    pub dispatched: usize,
    /// Frames that reached a terminal outcome.
    pub processed: usize,
    /// Cursor persisted at shutdown.
    pub final_cursor: Option<u64>,
}

/// Running pipeline threads.
pub struct PipelineHandle {
    dispatcher: thread::JoinHandle<(usize, usize)>,
    checkpointer: thread::JoinHandle<()>,
    stop_checkpointer: crossbeam_channel::Sender<()>,
    cursor: Arc<CursorManager>,
}

impl PipelineHandle {
    /// Wait for the queue and lanes to drain, then persist the final cursor.
    ///
    /// Every [`FrameSink`] must have been dropped, otherwise this waits
    /// forever.
    pub fn join(self) -> Result<PipelineStats> {
        let (dispatched, processed) = self
            .dispatcher
            .join()
            .map_err(|_| Error::Task("dispatcher thread panicked".to_string()))?;

        drop(self.stop_checkpointer);
        if self.checkpointer.join().is_err() {
            warn!("Checkpoint thread panicked");
        }

        self.cursor.flush()?;
        let final_cursor = self.cursor.load()?;
        info!(
            "Pipeline stopped: {} dispatched, {} processed, cursor {:?}",
            dispatched, processed, final_cursor
        );

        Ok(PipelineStats {
            dispatched,
            processed,
            final_cursor,
        })
    }

    /// Await `source`, then drain and join the pipeline.
    ///
    /// The source must own the last [`FrameSink`]. Both results are
    /// returned, so the final checkpoint is written even when the source
    /// failed.
    pub async fn join_after<T>(
        self,
        source: impl std::future::Future<Output = Result<T>>,
    ) -> (Result<T>, Result<PipelineStats>) {
        let source_result = source.await;
        info!("Source stopped, draining in-flight frames...");
        let joined = tokio::task::spawn_blocking(move || self.join())
            .await
            .map_err(|e| Error::Task(format!("pipeline join panicked: {e}")))
            .and_then(|result| result);
        (source_result, joined)
    }
}

/// Wires the queue, dispatcher thread, lanes and checkpointer together.
pub struct Pipeline {
    config: PipelineConfig,
    processor: Arc<FrameProcessor>,
    cursor: Arc<CursorManager>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        processor: Arc<FrameProcessor>,
        cursor: Arc<CursorManager>,
    ) -> Self {
        Self {
            config,
            processor,
            cursor,
        }
    }

    pub fn cursor(&self) -> &Arc<CursorManager> {
        &self.cursor
    }

    /// Start the background threads.
    pub fn start(&self) -> Result<(FrameSink, PipelineHandle)> {
        let (queue_tx, queue_rx) = bounded(self.config.queue_capacity);
        let lanes = LanePool::start(
            self.config.lanes,
            self.config.lane_capacity,
            Arc::clone(&self.processor),
            Arc::clone(&self.cursor),
        )?;

        let dispatcher = thread::Builder::new()
            .name("lattice-dispatch".to_string())
            .spawn(move || run_dispatcher(queue_rx, lanes))?;

        let (stop_checkpointer, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let cursor = Arc::clone(&self.cursor);
        let interval = self.config.checkpoint_interval;
        let checkpointer = thread::Builder::new()
            .name("lattice-checkpoint".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = cursor.flush() {
                            error!("Cursor checkpoint failed: {}", e);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        info!(
            "Pipeline started: {} lanes, queue capacity {}, checkpoint every {:?}",
            self.config.lanes.max(1),
            self.config.queue_capacity,
            interval
        );

        let sink = FrameSink {
            queue: queue_tx,
            cursor: Arc::clone(&self.cursor),
        };
        let handle = PipelineHandle {
            dispatcher,
            checkpointer,
            stop_checkpointer,
            cursor: Arc::clone(&self.cursor),
        };
        Ok((sink, handle))
    }
}

fn run_dispatcher(mut queue: QueueReceiver, lanes: LanePool) -> (usize, usize) {
    let mut dispatched = 0;

    while let Some(frame) = queue.dequeue_blocking() {
        let seq = frame.seq;
        if let Err(e) = lanes.submit(frame) {
            error!("Dropping seq {} without a lane: {}", seq, e);
            break;
        }
        dispatched += 1;
    }

    info!("Event queue drained after {} frames, stopping lanes", dispatched);
    let processed = lanes.shutdown().iter().sum();
    (dispatched, processed)
}
