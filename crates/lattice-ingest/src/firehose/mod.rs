//! Relay firehose client.
//!
//! # Architecture
//!
//! ```text
//! FirehoseTransport ──raw──► EventFilter ──CommitFrame──► FrameSink
//!        ▲                       │
//!        │ connect(cursor)       └─ filtered / invalid ──► cursor.observe
//! ReconnectPolicy
//! ```
//!
//! [`FirehoseSource`] owns the transport and runs on a dedicated tokio task.
//! The transport never retries; every connection loss comes back to the
//! source, which backs off and reconnects from the persisted cursor.

mod filter;
mod jetstream;
mod reconnect;
mod source;

pub use filter::{EventFilter, FilterResult, InterestSet};
pub use jetstream::{DEFAULT_ENDPOINT, JetstreamTransport, TransportConfig};
pub use reconnect::{ConnectionState, ReconnectPolicy, ReconnectState};
pub use source::{FirehoseSource, SourceStats};

use async_trait::async_trait;

use crate::Result;

/// One undecoded message from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame(pub String);

/// Ordered stream of raw frames from a relay.
///
/// Implementations must not reorder or drop frames and must not reconnect
/// on their own: any error ends the connection.
#[async_trait]
pub trait FirehoseTransport: Send {
    /// Open a stream starting just after `cursor` (live tail when `None`).
    async fn connect(&mut self, cursor: Option<u64>) -> Result<()>;

    /// Next frame. `Ok(None)` means the relay closed the stream.
    async fn next_frame(&mut self) -> Result<Option<RawFrame>>;

    /// Tear the connection down. Safe to call when not connected.
    async fn close(&mut self);
}
