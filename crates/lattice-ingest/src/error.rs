//! Error types for the ingestion pipeline.
//!
//! [`Error`] covers infrastructure failures (opening databases, transport,
//! configuration). [`StoreError`] is what a store call returns; it carries a
//! [`StoreErrorKind`] so the classifier can decide whether to retry.
//! [`FrameError`] is the per-frame failure taxonomy the processor acts on.

use crate::saga::IndexingStage;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Result of a single store call.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while running the ingester.
#[derive(Error, Debug)]
pub enum Error {
    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Frame or record validation failed.
    #[error("Frame error: {0}")]
    Frame(#[from] lattice_core::Error),

    /// SQLite error outside a store call (schema setup, dead letters, cursor).
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Relay transport error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// HTTP error talking to an origin repository.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// A background thread or task failed.
    #[error("Task failed: {0}")]
    Task(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dead-letter entry does not exist.
    #[error("Dead-letter entry {0} not found")]
    EntryNotFound(i64),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Broad category of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// The store could not be reached or the connection dropped.
    Connectivity,
    /// The call timed out or the store was busy/locked.
    Timeout,
    /// Out of disk, memory, file handles or similar.
    ResourceExhausted,
    /// The record violates a store constraint.
    Constraint,
    /// The record does not fit the store's schema.
    Schema,
    /// The record's content was rejected by the store.
    Validation,
    /// Anything not recognised above.
    Other,
}

impl StoreErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Constraint => "constraint",
            Self::Schema => "schema",
            Self::Validation => "validation",
            Self::Other => "other",
        }
    }
}

/// A failed store call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{store} {} error: {message}", .kind.as_str())]
pub struct StoreError {
    /// Which store raised it ("sqlite", "tantivy", "rocksdb", ...).
    pub store: &'static str,
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(store: &'static str, kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            store,
            kind,
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let kind = match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => StoreErrorKind::Timeout,
            Some(ErrorCode::DiskFull | ErrorCode::OutOfMemory | ErrorCode::TooBig) => {
                StoreErrorKind::ResourceExhausted
            }
            Some(ErrorCode::CannotOpen | ErrorCode::SystemIoFailure | ErrorCode::NotADatabase) => {
                StoreErrorKind::Connectivity
            }
            Some(ErrorCode::ConstraintViolation) => StoreErrorKind::Constraint,
            Some(ErrorCode::TypeMismatch | ErrorCode::SchemaChanged) => StoreErrorKind::Schema,
            _ => match &e {
                rusqlite::Error::ToSqlConversionFailure(_)
                | rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::InvalidColumnType(..) => StoreErrorKind::Schema,
                _ => StoreErrorKind::Other,
            },
        };
        StoreError::new("sqlite", kind, e.to_string())
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;

        let kind = match e.kind() {
            ErrorKind::TimedOut | ErrorKind::Busy | ErrorKind::TryAgain => StoreErrorKind::Timeout,
            ErrorKind::IOError | ErrorKind::ShutdownInProgress | ErrorKind::Incomplete => {
                StoreErrorKind::Connectivity
            }
            ErrorKind::Corruption => StoreErrorKind::Schema,
            ErrorKind::InvalidArgument | ErrorKind::NotSupported => StoreErrorKind::Validation,
            _ => StoreErrorKind::Other,
        };
        StoreError::new("rocksdb", kind, e.into_string())
    }
}

impl From<tantivy::TantivyError> for StoreError {
    fn from(e: tantivy::TantivyError) -> Self {
        use tantivy::TantivyError;

        let kind = match &e {
            TantivyError::IoError(_) | TantivyError::LockFailure(..) => {
                StoreErrorKind::Connectivity
            }
            TantivyError::SchemaError(_) | TantivyError::FieldNotFound(_) => StoreErrorKind::Schema,
            TantivyError::InvalidArgument(_) => StoreErrorKind::Validation,
            TantivyError::ErrorInThread(_) | TantivyError::Poisoned => StoreErrorKind::Timeout,
            _ => StoreErrorKind::Other,
        };
        StoreError::new("tantivy", kind, e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::new("codec", StoreErrorKind::Schema, e.to_string())
    }
}

/// Why a frame did not make it through, in the order it can happen.
#[derive(Error, Debug, Clone)]
pub enum FrameError {
    /// The frame is outside the interest set or is not a commit.
    #[error("filtered out: {0}")]
    FilteredOut(String),

    /// The frame or its record payload is malformed. Never retried.
    #[error("validation failure: {0}")]
    ValidationFailure(String),

    /// The first store stage failed; nothing was written.
    #[error("store failure: {0}")]
    TransientStoreFailure(StoreError),

    /// A later stage failed and the committed stages were compensated.
    #[error("partial index failure at {stage}: {source}")]
    PartialIndexFailure {
        stage: IndexingStage,
        source: StoreError,
    },

    /// The retry budget ran out.
    #[error("poison frame after {attempts} attempts: {last}")]
    PoisonFrame { attempts: u32, last: Box<FrameError> },
}

impl From<lattice_core::Error> for FrameError {
    fn from(e: lattice_core::Error) -> Self {
        FrameError::ValidationFailure(e.to_string())
    }
}

impl FrameError {
    /// The store error behind this failure, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::TransientStoreFailure(e) | Self::PartialIndexFailure { source: e, .. } => Some(e),
            Self::PoisonFrame { last, .. } => last.store_error(),
            _ => None,
        }
    }

    /// Short label used in metrics and dead-letter rows.
    pub fn label(&self) -> &'static str {
        match self {
            Self::FilteredOut(_) => "filtered_out",
            Self::ValidationFailure(_) => "validation_failure",
            Self::TransientStoreFailure(_) => "transient_store_failure",
            Self::PartialIndexFailure { .. } => "partial_index_failure",
            Self::PoisonFrame { .. } => "poison_frame",
        }
    }
}
