//! Worker lanes.
//!
//! Each lane is an OS thread draining a bounded crossbeam channel in order.
//! Frames are routed by [`EntityReference::partition_hash`], so every frame
//! for one entity is applied by the same lane in arrival order while
//! different entities proceed in parallel.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use lattice_core::{CommitFrame, EntityReference};
use tracing::{debug, error, info};

use super::processor::FrameProcessor;
use crate::cursor::CursorManager;
use crate::{Error, Result};

/// Fixed pool of sequential lanes.
pub struct LanePool {
    senders: Vec<Sender<CommitFrame>>,
    handles: Vec<thread::JoinHandle<usize>>,
}

impl LanePool {
    /// Spawn `lanes` workers, each buffering up to `capacity` frames.
    pub fn start(
        lanes: usize,
        capacity: usize,
        processor: Arc<FrameProcessor>,
        cursor: Arc<CursorManager>,
    ) -> Result<Self> {
        let lanes = lanes.max(1);
        let mut senders = Vec::with_capacity(lanes);
        let mut handles = Vec::with_capacity(lanes);

        for lane in 0..lanes {
            let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
            let processor = Arc::clone(&processor);
            let cursor = Arc::clone(&cursor);

            let handle = thread::Builder::new()
                .name(format!("lattice-lane-{lane}"))
                .spawn(move || run_lane(lane, rx, &processor, &cursor))?;

            senders.push(tx);
            handles.push(handle);
        }

        info!("Started {} worker lanes", lanes);
        Ok(Self { senders, handles })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Lane that owns `entity`.
    pub fn lane_for(&self, entity: &EntityReference) -> usize {
        (entity.partition_hash() % self.senders.len() as u64) as usize
    }

    /// Hand a frame to its lane, blocking while that lane is full.
    pub fn submit(&self, frame: CommitFrame) -> Result<()> {
        let lane = self.lane_for(&frame.entity_ref());
        self.senders[lane]
            .send(frame)
            .map_err(|e| Error::ChannelSend(format!("lane {lane} stopped at seq {}", e.0.seq)))
    }

    /// Close every lane and wait for in-flight frames to finish.
    ///
    /// Returns the number of frames each lane processed.
    pub fn shutdown(self) -> Vec<usize> {
        drop(self.senders);

        self.handles
            .into_iter()
            .enumerate()
            .map(|(lane, handle)| match handle.join() {
                Ok(processed) => processed,
                Err(e) => {
                    error!("Lane {} panicked: {:?}", lane, e);
                    0
                }
            })
            .collect()
    }
}

fn run_lane(
    lane: usize,
    rx: Receiver<CommitFrame>,
    processor: &FrameProcessor,
    cursor: &CursorManager,
) -> usize {
    debug!("Lane {} started", lane);
    let mut processed = 0;

    for frame in rx.iter() {
        match processor.process(&frame) {
            Ok(outcome) => {
                debug!(
                    "Lane {} finished seq {} ({}): {:?}",
                    lane,
                    frame.seq,
                    frame.entity_ref(),
                    outcome
                );
                cursor.resolve(frame.seq);
                processed += 1;
            }
            Err(e) => {
                // Left unresolved: the cursor stays behind this frame and it
                // is replayed after a restart.
                error!(
                    entity = %frame.entity_ref(),
                    seq = frame.seq,
                    collection = %frame.collection,
                    operation = %frame.operation,
                    "Frame could not reach a terminal outcome: {}", e
                );
            }
        }
    }

    debug!("Lane {} stopped after {} frames", lane, processed);
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadletter::DeadLetterStore;
    use crate::dispatch::{Applied, CommitHandler, Dispatcher, Operation};
    use crate::error::FrameError;
    use crate::pipeline::ProcessorConfig;
    use lattice_core::{OperationKind, RecordKind};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Log {
        applied: Mutex<Vec<(String, u64)>>,
    }

    impl CommitHandler for Log {
        fn handle(&self, op: &Operation<'_>) -> std::result::Result<Applied, FrameError> {
            self.applied
                .lock()
                .push((op.frame.rkey.clone(), op.frame.seq));
            Ok(Applied::Deleted { failed: Vec::new() })
        }
    }

    fn delete(seq: u64, rkey: &str) -> CommitFrame {
        CommitFrame {
            seq,
            did: "did:plc:abc".to_string(),
            collection: "pub.lattice.tag".to_string(),
            rkey: rkey.to_string(),
            operation: OperationKind::Delete,
            cid: None,
            record: None,
            rev: None,
        }
    }

    #[test]
    fn test_per_entity_order_and_cursor_resolution() {
        let log = Arc::new(Log::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(RecordKind::UserTag, OperationKind::Delete, log.clone());
        let processor = Arc::new(FrameProcessor::new(
            Arc::new(dispatcher),
            Arc::new(DeadLetterStore::open_in_memory().unwrap()),
            ProcessorConfig::default(),
        ));
        let cursor = Arc::new(CursorManager::open_in_memory().unwrap());

        let pool = LanePool::start(4, 2, processor, cursor.clone()).unwrap();
        assert_eq!(pool.len(), 4);

        let mut seq = 0;
        for _ in 0..5 {
            for rkey in ["a", "b", "c"] {
                seq += 1;
                cursor.track(seq);
                pool.submit(delete(seq, rkey)).unwrap();
            }
        }
        let processed: usize = pool.shutdown().iter().sum();
        assert_eq!(processed, 15);

        let applied = log.applied.lock();
        for rkey in ["a", "b", "c"] {
            let seqs: Vec<u64> = applied
                .iter()
                .filter(|(k, _)| k == rkey)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs.len(), 5);
            assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{rkey}: {seqs:?}");
        }

        assert_eq!(cursor.safe_point(), Some(15));
    }

    #[test]
    fn test_same_entity_same_lane() {
        let processor = Arc::new(FrameProcessor::new(
            Arc::new(Dispatcher::new()),
            Arc::new(DeadLetterStore::open_in_memory().unwrap()),
            ProcessorConfig::default(),
        ));
        let cursor = Arc::new(CursorManager::open_in_memory().unwrap());
        let pool = LanePool::start(8, 1, processor, cursor).unwrap();

        let entity = delete(1, "x").entity_ref();
        let lane = pool.lane_for(&entity);
        assert_eq!(pool.lane_for(&delete(99, "x").entity_ref()), lane);
        assert!(lane < 8);
        pool.shutdown();
    }
}
