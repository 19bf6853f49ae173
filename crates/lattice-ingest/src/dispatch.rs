//! Commit dispatcher.
//!
//! Pure routing: identifies `(record kind, operation)` for a frame, decodes
//! the record payload, and invokes the one handler registered for that pair.

use std::collections::HashMap;
use std::sync::Arc;

use lattice_core::{CommitFrame, EntityReference, OperationKind, Record, RecordKind};
use metrics::counter;
use tracing::warn;

use crate::error::FrameError;
use crate::saga::{IndexingSaga, IndexingStage, SagaOutcome};

/// Terminal success outcomes of a dispatched frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Written to the listed stores.
    Indexed(Vec<IndexingStage>),
    /// Removed; the listed stores failed to delete and were not retried.
    Deleted { failed: Vec<IndexingStage> },
    /// A newer version is already indexed.
    Stale,
    /// In the interest set but no handler is registered.
    Unhandled,
}

/// A decoded operation handed to a handler.
pub struct Operation<'a> {
    pub frame: &'a CommitFrame,
    pub entity: EntityReference,
    pub kind: RecordKind,
    /// Decoded payload; `None` for deletes.
    pub record: Option<Record>,
}

/// Applies one kind of operation to the stores.
pub trait CommitHandler: Send + Sync {
    fn handle(&self, op: &Operation<'_>) -> Result<Applied, FrameError>;
}

/// Runs creates and updates through the indexing saga.
pub struct UpsertHandler {
    saga: Arc<IndexingSaga>,
}

impl UpsertHandler {
    pub fn new(saga: Arc<IndexingSaga>) -> Self {
        Self { saga }
    }
}

impl CommitHandler for UpsertHandler {
    fn handle(&self, op: &Operation<'_>) -> Result<Applied, FrameError> {
        let record = op.record.as_ref().ok_or_else(|| {
            FrameError::ValidationFailure(format!("{} has no record body", op.entity))
        })?;

        match self.saga.index(op.frame, &op.entity, record) {
            SagaOutcome::Committed { stages } => Ok(Applied::Indexed(stages)),
            SagaOutcome::Stale { .. } => Ok(Applied::Stale),
            SagaOutcome::Rejected { reason } => Err(FrameError::ValidationFailure(reason)),
            SagaOutcome::Failed {
                stage,
                error,
                compensated,
            } => {
                if compensated.is_empty() {
                    Err(FrameError::TransientStoreFailure(error))
                } else {
                    Err(FrameError::PartialIndexFailure {
                        stage,
                        source: error,
                    })
                }
            }
            SagaOutcome::Deleted { .. } => unreachable!("index never reports a delete"),
        }
    }
}

/// Runs the best-effort delete.
pub struct DeleteHandler {
    saga: Arc<IndexingSaga>,
}

impl DeleteHandler {
    pub fn new(saga: Arc<IndexingSaga>) -> Self {
        Self { saga }
    }
}

impl CommitHandler for DeleteHandler {
    fn handle(&self, op: &Operation<'_>) -> Result<Applied, FrameError> {
        match self.saga.delete(op.frame, &op.entity) {
            SagaOutcome::Stale { .. } => Ok(Applied::Stale),
            SagaOutcome::Deleted { failed } => Ok(Applied::Deleted {
                failed: failed.into_iter().map(|(stage, _)| stage).collect(),
            }),
            other => unreachable!("delete reported {other:?}"),
        }
    }
}

/// Handler registry keyed by `(kind, operation)`.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<(RecordKind, OperationKind), Arc<dyn CommitHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create/update/delete for every known record kind.
    pub fn with_default_handlers(saga: Arc<IndexingSaga>) -> Self {
        let upsert: Arc<dyn CommitHandler> = Arc::new(UpsertHandler::new(saga.clone()));
        let delete: Arc<dyn CommitHandler> = Arc::new(DeleteHandler::new(saga));

        let mut dispatcher = Self::new();
        for kind in RecordKind::ALL {
            dispatcher.register(kind, OperationKind::Create, upsert.clone());
            dispatcher.register(kind, OperationKind::Update, upsert.clone());
            dispatcher.register(kind, OperationKind::Delete, delete.clone());
        }
        dispatcher
    }

    /// Register (or replace) the handler for a pair.
    pub fn register(
        &mut self,
        kind: RecordKind,
        operation: OperationKind,
        handler: Arc<dyn CommitHandler>,
    ) {
        self.handlers.insert((kind, operation), handler);
    }

    pub fn is_registered(&self, kind: RecordKind, operation: OperationKind) -> bool {
        self.handlers.contains_key(&(kind, operation))
    }

    /// Route one frame to its handler.
    pub fn dispatch(&self, frame: &CommitFrame) -> Result<Applied, FrameError> {
        let Some(kind) = RecordKind::from_nsid(&frame.collection) else {
            warn!(
                "No record kind for collection {} ({}); check the interest set",
                frame.collection,
                frame.entity_ref()
            );
            counter!("pipeline_frames_unhandled_total", "collection" => frame.collection.clone())
                .increment(1);
            return Ok(Applied::Unhandled);
        };

        let Some(handler) = self.handlers.get(&(kind, frame.operation)) else {
            warn!(
                "No handler registered for {} {} ({})",
                kind,
                frame.operation,
                frame.entity_ref()
            );
            counter!("pipeline_frames_unhandled_total", "collection" => frame.collection.clone())
                .increment(1);
            return Ok(Applied::Unhandled);
        };

        let record = match frame.operation {
            OperationKind::Create | OperationKind::Update => {
                let decoded = frame
                    .record
                    .as_ref()
                    .ok_or(lattice_core::Error::MissingField("record"))
                    .and_then(|body| Record::decode(kind, body));
                match decoded {
                    Ok(record) => Some(record),
                    Err(e) => {
                        counter!("pipeline_frames_rejected_total", "kind" => kind.as_str())
                            .increment(1);
                        return Err(e.into());
                    }
                }
            }
            OperationKind::Delete => None,
        };

        handler.handle(&Operation {
            frame,
            entity: frame.entity_ref(),
            kind,
            record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(RecordKind, OperationKind, bool)>>,
    }

    impl CommitHandler for Recording {
        fn handle(&self, op: &Operation<'_>) -> Result<Applied, FrameError> {
            self.seen
                .lock()
                .push((op.kind, op.frame.operation, op.record.is_some()));
            Ok(Applied::Indexed(vec![IndexingStage::Relational]))
        }
    }

    fn frame(collection: &str, operation: OperationKind, record: serde_json::Value) -> CommitFrame {
        CommitFrame {
            seq: 1,
            did: "did:plc:abc".to_string(),
            collection: collection.to_string(),
            rkey: "k".to_string(),
            operation,
            cid: Some("bafyreiabcdefgh".to_string()),
            record: Some(record),
            rev: None,
        }
    }

    #[test]
    fn test_routes_to_registered_handler() {
        let recording = Arc::new(Recording::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(RecordKind::Review, OperationKind::Create, recording.clone());

        let f = frame(
            "pub.lattice.review",
            OperationKind::Create,
            json!({
                "subject": {"uri": "at://did:plc:x/pub.lattice.preprint/p", "cid": "bafyabc"},
                "text": "ok",
                "createdAt": "2024-01-01T00:00:00Z"
            }),
        );
        assert!(matches!(dispatcher.dispatch(&f), Ok(Applied::Indexed(_))));
        assert_eq!(
            recording.seen.lock().as_slice(),
            &[(RecordKind::Review, OperationKind::Create, true)]
        );
    }

    #[test]
    fn test_missing_handler_is_unhandled() {
        let dispatcher = Dispatcher::new();
        let f = frame("pub.lattice.review", OperationKind::Delete, json!({}));
        assert_eq!(dispatcher.dispatch(&f).unwrap(), Applied::Unhandled);

        let unknown = frame("pub.lattice.poll", OperationKind::Create, json!({}));
        assert_eq!(dispatcher.dispatch(&unknown).unwrap(), Applied::Unhandled);
    }

    #[test]
    fn test_undecodable_payload_is_validation_failure() {
        let recording = Arc::new(Recording::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(RecordKind::Preprint, OperationKind::Create, recording.clone());

        let f = frame("pub.lattice.preprint", OperationKind::Create, json!({"title": 7}));
        assert!(matches!(
            dispatcher.dispatch(&f),
            Err(FrameError::ValidationFailure(_))
        ));
        assert!(recording.seen.lock().is_empty());
    }

    #[test]
    fn test_delete_has_no_record() {
        let recording = Arc::new(Recording::default());
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(RecordKind::UserTag, OperationKind::Delete, recording.clone());

        let mut f = frame("pub.lattice.tag", OperationKind::Delete, json!({}));
        f.record = None;
        dispatcher.dispatch(&f).unwrap();
        assert_eq!(
            recording.seen.lock().as_slice(),
            &[(RecordKind::UserTag, OperationKind::Delete, false)]
        );
    }
}
