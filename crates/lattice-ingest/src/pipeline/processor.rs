//! Per-frame retry loop.
//!
//! The processor joins the dispatcher, the classifier and the dead-letter
//! store. A frame is attempted up to `max_retries + 1` times; a terminal
//! failure stops immediately. Whatever cannot be applied ends up in the
//! dead-letter store, so every call reaches a terminal outcome unless the
//! dead-letter write itself fails.
//!
//! Lanes, requeues and reindex requests share one processor. Each dispatch
//! holds a lock striped by entity, so two writers never run the saga for the
//! same entity at once.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lattice_core::CommitFrame;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::classify::{Classification, classify};
use crate::deadletter::DeadLetterStore;
use crate::dispatch::{Applied, Dispatcher};
use crate::error::FrameError;

const ENTITY_LOCK_STRIPES: usize = 64;

/// Retry settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Retries after the first attempt for retryable failures.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
    /// Upper bound on the retry delay.
    pub max_retry_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            max_retry_backoff: Duration::from_secs(5),
        }
    }
}

impl ProcessorConfig {
    fn delay_before_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }
}

/// Terminal outcome of one frame.
#[derive(Debug, Clone)]
pub enum FrameOutcome {
    Applied(Applied),
    /// Stored (or kept) in the dead-letter store under `id`.
    DeadLettered {
        id: i64,
        classification: Classification,
        error: FrameError,
    },
}

impl FrameOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Summary of a dead-letter sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub requeued: usize,
    pub still_failing: usize,
}

struct Failure {
    error: FrameError,
    classification: Classification,
    retries: u32,
}

/// Applies frames with retries and dead-lettering.
pub struct FrameProcessor {
    dispatcher: Arc<Dispatcher>,
    dead_letters: Arc<DeadLetterStore>,
    config: ProcessorConfig,
    entity_locks: Vec<Mutex<()>>,
}

impl FrameProcessor {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        dead_letters: Arc<DeadLetterStore>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            dispatcher,
            dead_letters,
            config,
            entity_locks: (0..ENTITY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    /// Process one frame to a terminal outcome.
    ///
    /// Returns `Err` only when the frame failed and could not be written to
    /// the dead-letter store; the caller must then treat the frame as
    /// unresolved.
    pub fn process(&self, frame: &CommitFrame) -> Result<FrameOutcome> {
        let started = Instant::now();
        let result = self.attempt(frame);
        histogram!("pipeline_frame_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(applied) => {
                record_applied(frame, &applied);
                Ok(FrameOutcome::Applied(applied))
            }
            Err(failure) => {
                let entity = frame.entity_ref();
                let id = self
                    .dead_letters
                    .dead_letter(frame, &failure.error, failure.classification, failure.retries)
                    .inspect_err(|e| {
                        error!(
                            entity = %entity,
                            seq = frame.seq,
                            error = %failure.error,
                            "Failed to dead-letter frame: {}", e
                        );
                    })?;

                counter!("deadletter_entries_total", "classification" => failure.classification.as_str())
                    .increment(1);
                warn!(
                    entity = %entity,
                    seq = frame.seq,
                    collection = %frame.collection,
                    operation = %frame.operation,
                    retries = failure.retries,
                    classification = failure.classification.as_str(),
                    "Dead-lettered frame as entry {}: {}",
                    id,
                    failure.error
                );

                Ok(FrameOutcome::DeadLettered {
                    id,
                    classification: failure.classification,
                    error: failure.error,
                })
            }
        }
    }

    /// Resubmit a dead-letter entry. Success removes it; failure bumps its
    /// retry count.
    pub fn requeue(&self, id: i64) -> Result<FrameOutcome> {
        let entry = self
            .dead_letters
            .get(id)?
            .ok_or(crate::Error::EntryNotFound(id))?;

        match self.attempt(&entry.frame) {
            Ok(applied) => {
                self.dead_letters.remove(id)?;
                record_applied(&entry.frame, &applied);
                counter!("deadletter_requeued_total", "result" => "applied").increment(1);
                info!("Requeued dead-letter entry {} ({})", id, entry.frame.entity_ref());
                Ok(FrameOutcome::Applied(applied))
            }
            Err(failure) => {
                self.dead_letters
                    .record_failure(id, &failure.error, failure.classification)?;
                counter!("deadletter_requeued_total", "result" => "failed").increment(1);
                warn!(
                    "Requeue of dead-letter entry {} failed again: {}",
                    id, failure.error
                );
                Ok(FrameOutcome::DeadLettered {
                    id,
                    classification: failure.classification,
                    error: failure.error,
                })
            }
        }
    }

    /// Requeue up to `limit` of the oldest entries.
    pub fn sweep(&self, limit: usize) -> Result<SweepReport> {
        let entries = self.dead_letters.list_entries(limit, 0)?;
        let mut report = SweepReport::default();

        for entry in entries {
            if self.requeue(entry.id)?.is_applied() {
                report.requeued += 1;
            } else {
                report.still_failing += 1;
            }
        }

        info!(
            "Dead-letter sweep: {} requeued, {} still failing",
            report.requeued, report.still_failing
        );
        Ok(report)
    }

    fn attempt(&self, frame: &CommitFrame) -> std::result::Result<Applied, Failure> {
        let stripe =
            (frame.entity_ref().partition_hash() % self.entity_locks.len() as u64) as usize;
        let mut retries = 0;

        loop {
            // Released before any backoff sleep.
            let dispatched = {
                let _entity = self.entity_locks[stripe].lock();
                self.dispatcher.dispatch(frame)
            };
            let error = match dispatched {
                Ok(applied) => return Ok(applied),
                Err(e) => e,
            };

            let classification = classify(&error);
            if classification == Classification::Terminal {
                return Err(Failure {
                    error,
                    classification,
                    retries,
                });
            }

            if retries >= self.config.max_retries {
                return Err(Failure {
                    error: FrameError::PoisonFrame {
                        attempts: retries + 1,
                        last: Box::new(error),
                    },
                    classification,
                    retries,
                });
            }

            retries += 1;
            let delay = self.config.delay_before_retry(retries);
            counter!("pipeline_frames_retried_total").increment(1);
            debug!(
                entity = %frame.entity_ref(),
                seq = frame.seq,
                retry = retries,
                "Retrying in {:?} after: {}",
                delay,
                error
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }
}

fn record_applied(frame: &CommitFrame, applied: &Applied) {
    match applied {
        Applied::Indexed(_) | Applied::Deleted { .. } => {
            counter!(
                "pipeline_frames_indexed_total",
                "kind" => frame.collection.clone(),
                "operation" => frame.operation.as_str()
            )
            .increment(1);
        }
        Applied::Stale => counter!("pipeline_frames_stale_total").increment(1),
        Applied::Unhandled => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{CommitHandler, Operation};
    use crate::error::{StoreError, StoreErrorKind};
    use crate::saga::IndexingStage;
    use lattice_core::{OperationKind, RecordKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the given error kind for the first `failures` calls.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        kind: StoreErrorKind,
    }

    impl Flaky {
        fn new(failures: u32, kind: StoreErrorKind) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                kind,
            })
        }
    }

    impl CommitHandler for Flaky {
        fn handle(&self, _op: &Operation<'_>) -> std::result::Result<Applied, FrameError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(FrameError::TransientStoreFailure(StoreError::new(
                    "test", self.kind, "flaky",
                )))
            } else {
                Ok(Applied::Indexed(vec![IndexingStage::Relational]))
            }
        }
    }

    fn config(max_retries: u32) -> ProcessorConfig {
        ProcessorConfig {
            max_retries,
            retry_backoff: Duration::ZERO,
            max_retry_backoff: Duration::ZERO,
        }
    }

    fn processor(handler: Arc<Flaky>, max_retries: u32) -> FrameProcessor {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(RecordKind::UserTag, OperationKind::Create, handler);
        FrameProcessor::new(
            Arc::new(dispatcher),
            Arc::new(DeadLetterStore::open_in_memory().unwrap()),
            config(max_retries),
        )
    }

    fn frame() -> CommitFrame {
        CommitFrame {
            seq: 7,
            did: "did:plc:abc".to_string(),
            collection: "pub.lattice.tag".to_string(),
            rkey: "t1".to_string(),
            operation: OperationKind::Create,
            cid: Some("bafyreiabcdefgh".to_string()),
            record: Some(json!({
                "subject": {"uri": "at://did:plc:x/pub.lattice.preprint/p", "cid": "bafyabc"},
                "tag": "rust",
                "createdAt": "2024-01-01T00:00:00Z"
            })),
            rev: None,
        }
    }

    #[test]
    fn test_retry_then_success() {
        let handler = Flaky::new(2, StoreErrorKind::Timeout);
        let processor = processor(handler.clone(), 3);

        let outcome = processor.process(&frame()).unwrap();
        assert!(outcome.is_applied());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(processor.dead_letters().count().unwrap(), 0);
    }

    #[test]
    fn test_dead_letter_after_exactly_max_retries() {
        let handler = Flaky::new(u32::MAX, StoreErrorKind::Connectivity);
        let processor = processor(handler.clone(), 2);

        let outcome = processor.process(&frame()).unwrap();
        let FrameOutcome::DeadLettered { id, error, .. } = outcome else {
            panic!("expected dead letter, got {outcome:?}");
        };
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(error, FrameError::PoisonFrame { attempts: 3, .. }));

        let entry = processor.dead_letters().get(id).unwrap().unwrap();
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.classification, Classification::Retryable);
        assert_eq!(entry.error_label, "poison_frame");
    }

    #[test]
    fn test_terminal_failure_is_not_retried() {
        let handler = Flaky::new(u32::MAX, StoreErrorKind::Constraint);
        let processor = processor(handler.clone(), 5);

        let outcome = processor.process(&frame()).unwrap();
        assert!(matches!(
            outcome,
            FrameOutcome::DeadLettered {
                classification: Classification::Terminal,
                ..
            }
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_requeue_removes_entry_on_success() {
        // process() and the first requeue each burn two attempts; the
        // second requeue succeeds.
        let handler = Flaky::new(4, StoreErrorKind::Timeout);
        let processor = processor(handler, 1);

        let FrameOutcome::DeadLettered { id, .. } = processor.process(&frame()).unwrap() else {
            panic!("expected dead letter");
        };

        let again = processor.requeue(id).unwrap();
        assert!(!again.is_applied());
        let entry = processor.dead_letters().get(id).unwrap().unwrap();
        assert_eq!(entry.retry_count, 2);

        assert!(processor.requeue(id).unwrap().is_applied());
        assert!(processor.dead_letters().get(id).unwrap().is_none());
        assert!(matches!(
            processor.requeue(id),
            Err(crate::Error::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_sweep() {
        let handler = Flaky::new(2, StoreErrorKind::Timeout);
        let processor = processor(handler, 0);

        processor.process(&frame()).unwrap();
        let mut second = frame();
        second.rkey = "t2".to_string();
        processor.process(&second).unwrap();
        assert_eq!(processor.dead_letters().count().unwrap(), 2);

        let report = processor.sweep(10).unwrap();
        assert_eq!(
            report,
            SweepReport {
                requeued: 2,
                still_failing: 0
            }
        );
        assert_eq!(processor.dead_letters().count().unwrap(), 0);
    }

    /// Records how many calls overlap.
    #[derive(Default)]
    struct Overlap {
        active: AtomicU32,
        max_active: AtomicU32,
    }

    impl CommitHandler for Overlap {
        fn handle(&self, _op: &Operation<'_>) -> std::result::Result<Applied, FrameError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Applied::Indexed(Vec::new()))
        }
    }

    #[test]
    fn test_same_entity_is_never_dispatched_concurrently() {
        let handler = Arc::new(Overlap::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(RecordKind::UserTag, OperationKind::Create, handler.clone());
        let processor = Arc::new(FrameProcessor::new(
            Arc::new(dispatcher),
            Arc::new(DeadLetterStore::open_in_memory().unwrap()),
            config(0),
        ));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let processor = Arc::clone(&processor);
                thread::spawn(move || {
                    for _ in 0..5 {
                        assert!(processor.process(&frame()).unwrap().is_applied());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(handler.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = ProcessorConfig {
            max_retries: 10,
            retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_millis(350),
        };
        assert_eq!(config.delay_before_retry(1), Duration::from_millis(100));
        assert_eq!(config.delay_before_retry(2), Duration::from_millis(200));
        assert_eq!(config.delay_before_retry(3), Duration::from_millis(350));
        assert_eq!(config.delay_before_retry(30), Duration::from_millis(350));
    }
}
