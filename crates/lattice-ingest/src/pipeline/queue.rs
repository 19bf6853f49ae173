//! Bounded event queue between the firehose and the dispatcher.
//!
//! A full queue makes [`QueueSender::enqueue`] wait, which in turn stops the
//! source reading from the socket. Nothing is ever dropped. Dropping every
//! sender closes the queue; the receiver drains what is left and then sees
//! `None`.

use lattice_core::CommitFrame;
use metrics::gauge;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Create a queue holding at most `capacity` frames.
pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Producer side of the event queue.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<CommitFrame>,
}

impl QueueSender {
    /// Append a frame, waiting while the queue is full.
    pub async fn enqueue(&self, frame: CommitFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|e| Error::ChannelSend(format!("event queue closed at seq {}", e.0.seq)))?;
        gauge!("pipeline_queue_depth").set(self.len() as f64);
        Ok(())
    }

    /// Frames currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the event queue.
pub struct QueueReceiver {
    rx: mpsc::Receiver<CommitFrame>,
}

impl QueueReceiver {
    /// Next frame, or `None` once the queue is closed and drained.
    pub async fn dequeue(&mut self) -> Option<CommitFrame> {
        let frame = self.rx.recv().await;
        gauge!("pipeline_queue_depth").set(self.rx.len() as f64);
        frame
    }

    /// Blocking variant of [`dequeue`](Self::dequeue) for the dispatcher
    /// thread. Must not be called from inside the async runtime.
    pub fn dequeue_blocking(&mut self) -> Option<CommitFrame> {
        let frame = self.rx.blocking_recv();
        gauge!("pipeline_queue_depth").set(self.rx.len() as f64);
        frame
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Stop accepting new frames; queued frames can still be dequeued.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
