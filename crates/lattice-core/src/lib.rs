//! Core types and shared utilities for the Lattice indexer.
//!
//! This crate provides:
//! - Commit frames, entity references and identifier validation
//! - The closed set of record kinds and their decoded payloads
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod frame;
pub mod metrics;
mod record;

pub use error::{Error, Result};
pub use frame::{
    CommitFrame, EntityReference, OperationKind, parse_at_uri, validate_cid, validate_did,
    validate_nsid, validate_rkey,
};
pub use record::{
    Author, EndorsementRecord, MAX_TAG_LEN, PreprintRecord, RECORD_NAMESPACE, Record, RecordKind,
    ReviewRecord, StrongRef, UserTagRecord, normalize_tag,
};
