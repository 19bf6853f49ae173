//! Firehose source loop.

use std::time::Instant;

use metrics::{counter, gauge};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::filter::{EventFilter, FilterResult};
use super::reconnect::{ReconnectPolicy, ReconnectState};
use super::{FirehoseTransport, RawFrame};
use crate::Result;
use crate::pipeline::FrameSink;

/// Counters reported when the source stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Raw frames received from the relay.
    pub received: u64,
    /// Commits handed to the pipeline.
    pub submitted: u64,
    /// Filtered or invalid frames.
    pub rejected: u64,
    /// Frames at or below the highest sequence already seen (relay replay
    /// after a reconnect).
    pub replayed: u64,
    /// Successful connections.
    pub connections: u64,
    /// Failed or dropped connections.
    pub disconnects: u64,
}

enum Stream {
    Lost,
    Shutdown,
}

/// Reads the relay stream into the pipeline, reconnecting forever.
pub struct FirehoseSource<T> {
    transport: T,
    filter: EventFilter,
    policy: ReconnectPolicy,
    stats: SourceStats,
}

impl<T: FirehoseTransport> FirehoseSource<T> {
    pub fn new(transport: T, filter: EventFilter, policy: ReconnectPolicy) -> Self {
        Self {
            transport,
            filter,
            policy,
            stats: SourceStats::default(),
        }
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    ///
    /// The sink is dropped on return, which closes the event queue.
    pub async fn run(
        mut self,
        sink: FrameSink,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SourceStats> {
        let mut reconnect = ReconnectState::new(self.policy.clone(), Instant::now());
        gauge!("firehose_connected").set(0.0);

        while !*shutdown.borrow() {
            let cursor = sink.resume_point()?;

            let connected = tokio::select! {
                result = self.transport.connect(cursor) => result,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(()) => {
                    reconnect.on_connected(Instant::now());
                    self.stats.connections += 1;
                    gauge!("firehose_connected").set(1.0);
                    gauge!("firehose_outage_seconds").set(0.0);
                    info!("Firehose connected, resuming after {:?}", cursor);

                    let ended = self.consume(&sink, &mut reconnect, &mut shutdown).await?;
                    self.transport.close().await;
                    gauge!("firehose_connected").set(0.0);
                    if matches!(ended, Stream::Shutdown) {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Firehose connection failed: {}", e);
                }
            }

            reconnect.on_disconnected(Instant::now());
            self.stats.disconnects += 1;
            counter!("firehose_reconnect_attempts_total").increment(1);

            let delay = reconnect.next_delay();
            gauge!("firehose_backoff_seconds").set(delay.as_secs_f64());
            gauge!("firehose_outage_seconds").set(reconnect.outage(Instant::now()).as_secs_f64());
            info!(
                "Reconnecting in {:?} (attempt {}, down for {:?})",
                delay,
                reconnect.attempt(),
                reconnect.outage(Instant::now())
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.transport.close().await;
        gauge!("firehose_connected").set(0.0);
        info!(
            "Firehose source stopped: {} received, {} submitted, {} rejected, {} replayed",
            self.stats.received, self.stats.submitted, self.stats.rejected, self.stats.replayed
        );
        Ok(self.stats)
    }

    async fn consume(
        &mut self,
        sink: &FrameSink,
        reconnect: &mut ReconnectState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Stream> {
        loop {
            let next = tokio::select! {
                next = self.transport.next_frame() => next,
                _ = shutdown.changed() => return Ok(Stream::Shutdown),
            };

            match next {
                Ok(Some(raw)) => {
                    self.stats.received += 1;
                    counter!("firehose_frames_received_total").increment(1);
                    reconnect.on_frame(Instant::now());
                    self.handle(raw, sink).await?;
                }
                Ok(None) => {
                    warn!("Firehose stream ended by relay");
                    return Ok(Stream::Lost);
                }
                Err(e) => {
                    warn!("Firehose connection lost: {}", e);
                    return Ok(Stream::Lost);
                }
            }
        }
    }

    async fn handle(&mut self, raw: RawFrame, sink: &FrameSink) -> Result<()> {
        let seq = match self.filter.filter(&raw.0) {
            FilterResult::Commit(frame) => {
                if sink.highest_seen() >= Some(frame.seq) {
                    self.stats.replayed += 1;
                    debug!("Skipping replayed seq {}", frame.seq);
                    return Ok(());
                }
                self.stats.submitted += 1;
                return sink.submit(frame).await;
            }
            FilterResult::Rejected { seq, .. } => {
                self.stats.rejected += 1;
                seq
            }
        };

        if let Some(seq) = seq
            && sink.highest_seen() < Some(seq)
        {
            sink.skip(seq);
        }
        Ok(())
    }
}
