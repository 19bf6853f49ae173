//! Lattice firehose ingestion and indexing pipeline.
//!
//! This crate consumes the relay firehose and projects Lattice records into
//! three stores: a relational index, a full-text search index and a graph
//! store.
//!
//! # Modules
//!
//! - [`firehose`] - Relay transport, event filter and reconnection
//! - [`pipeline`] - Event queue, worker lanes, retry loop and checkpointing
//! - [`dispatch`] - Routes commits to handlers by record kind and operation
//! - [`saga`] - Multi-store writes with compensation
//! - [`store`] - Store traits and their SQLite / Tantivy / RocksDB backends
//! - [`cursor`], [`deadletter`] - Durable ingestion state
//! - [`reindex`] - Manual reindex of single records
//! - [`admin`] - HTTP admin API for reindex and requeue on the live daemon
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ FirehoseSource  │  WebSocket, filter, reconnect with backoff
//! └────────┬────────┘
//!          │ bounded queue
//!          ▼
//! ┌─────────────────┐
//! │  Worker lanes   │  partitioned by entity; retries, dead letters
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  IndexingSaga   │  relational → search → graph, reverse compensation
//! └─────────────────┘
//! ```
//!
//! The relational index is the system of record for whether an entity is
//! indexed; the search and graph stores are derived from it.

pub mod admin;
pub mod classify;
pub mod cursor;
pub mod deadletter;
pub mod dispatch;
pub mod error;
pub mod firehose;
pub mod pipeline;
pub mod projection;
pub mod reindex;
pub mod saga;
pub mod schema;
pub mod store;

// Re-export commonly used types at crate root
pub use error::{Error, FrameError, Result, StoreError, StoreErrorKind};

pub use admin::{AdminClient, AdminState, OutcomeResponse};
pub use classify::{Classification, classify};
pub use cursor::{CursorManager, FIREHOSE_CURSOR_KEY};
pub use deadletter::{DeadLetterEntry, DeadLetterStore};
pub use dispatch::{Applied, CommitHandler, Dispatcher};
pub use firehose::{
    EventFilter, FirehoseSource, FirehoseTransport, InterestSet, JetstreamTransport, RawFrame,
    ReconnectPolicy, TransportConfig,
};
pub use pipeline::{
    FrameOutcome, FrameProcessor, FrameSink, Pipeline, PipelineConfig, PipelineHandle,
    ProcessorConfig, SweepReport, SweeperConfig, run_sweeper,
};
pub use reindex::{HttpRecordFetcher, RecordFetcher, ReindexConfig, Reindexer};
pub use saga::{IndexingSaga, IndexingStage, SagaOutcome};
pub use store::{
    GraphStore, RelationalStore, RocksGraphStore, SearchIndex, SqliteRelationalStore,
    TantivySearchIndex,
};
