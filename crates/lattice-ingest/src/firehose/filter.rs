//! Event filter.
//!
//! Turns a raw relay message into a validated [`CommitFrame`]. Frames for
//! collections outside the interest set, and non-commit events, are dropped
//! quietly. Malformed frames are logged and counted. Neither is retried or
//! dead-lettered.

use std::collections::BTreeSet;

use lattice_core::{CommitFrame, OperationKind, RecordKind};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::FrameError;

/// Collections the indexer subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestSet {
    collections: BTreeSet<String>,
}

impl InterestSet {
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: collections.into_iter().map(Into::into).collect(),
        }
    }

    /// Every collection with a record kind.
    pub fn all_kinds() -> Self {
        Self::new(RecordKind::ALL.iter().map(|kind| kind.nsid()))
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.collections.contains(collection)
    }

    /// Collections in sorted order.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl Default for InterestSet {
    fn default() -> Self {
        Self::all_kinds()
    }
}

/// What the filter made of a raw frame.
#[derive(Debug, Clone)]
pub enum FilterResult {
    /// A valid in-interest commit.
    Commit(CommitFrame),
    /// Dropped with [`FrameError::FilteredOut`] or
    /// [`FrameError::ValidationFailure`]. `seq` is `None` when the frame
    /// carried no usable sequence number.
    Rejected { seq: Option<u64>, error: FrameError },
}

/// Jetstream event envelope. Every field is optional so a malformed event
/// still yields its sequence number where possible.
#[derive(Debug, Deserialize)]
struct Envelope {
    did: Option<String>,
    time_us: Option<u64>,
    kind: Option<String>,
    commit: Option<Commit>,
}

#[derive(Debug, Deserialize)]
struct Commit {
    rev: Option<String>,
    operation: Option<String>,
    collection: Option<String>,
    rkey: Option<String>,
    record: Option<serde_json::Value>,
    cid: Option<String>,
}

/// Validates raw frames against the interest set.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    interest: InterestSet,
}

impl EventFilter {
    pub fn new(interest: InterestSet) -> Self {
        Self { interest }
    }

    pub fn interest(&self) -> &InterestSet {
        &self.interest
    }

    pub fn filter(&self, raw: &str) -> FilterResult {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => return invalid(None, "json", format!("undecodable frame: {e}")),
        };

        let Some(seq) = envelope.time_us else {
            return invalid(None, "time_us", "frame has no sequence number".to_string());
        };

        let kind = envelope.kind.as_deref().unwrap_or_default();
        if kind != "commit" {
            return filtered(seq, "kind", format!("{kind} event"));
        }

        let Some(commit) = envelope.commit else {
            return invalid(Some(seq), "commit", "commit event without commit body".to_string());
        };

        let Some(collection) = commit.collection else {
            return invalid(Some(seq), "collection", "commit without collection".to_string());
        };
        if !self.interest.contains(&collection) {
            return filtered(seq, "collection", collection);
        }

        let operation = match commit.operation.as_deref() {
            Some(op) => match op.parse::<OperationKind>() {
                Ok(operation) => operation,
                Err(e) => return invalid(Some(seq), "operation", e.to_string()),
            },
            None => return invalid(Some(seq), "operation", "commit without operation".to_string()),
        };

        let frame = CommitFrame {
            seq,
            did: envelope.did.unwrap_or_default(),
            collection,
            rkey: commit.rkey.unwrap_or_default(),
            operation,
            cid: commit.cid,
            record: commit.record,
            rev: commit.rev,
        };

        if let Err(e) = frame.validate() {
            let field = match &e {
                lattice_core::Error::InvalidField { field, .. } => *field,
                lattice_core::Error::MissingField(field) => *field,
                _ => "payload",
            };
            return invalid(
                Some(seq),
                field,
                format!("{} at seq {}: {}", frame.entity_ref(), seq, e),
            );
        }

        FilterResult::Commit(frame)
    }
}

fn filtered(seq: u64, reason: &'static str, detail: String) -> FilterResult {
    counter!("firehose_frames_filtered_total", "reason" => reason).increment(1);
    debug!("Filtered seq {}: {}", seq, detail);
    FilterResult::Rejected {
        seq: Some(seq),
        error: FrameError::FilteredOut(detail),
    }
}

fn invalid(seq: Option<u64>, field: &'static str, detail: String) -> FilterResult {
    counter!("firehose_frames_invalid_total", "field" => field).increment(1);
    warn!("Rejected invalid frame (seq {:?}): {}", seq, detail);
    FilterResult::Rejected {
        seq,
        error: FrameError::ValidationFailure(detail),
    }
}
