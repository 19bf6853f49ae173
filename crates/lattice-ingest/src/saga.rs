//! Multi-store indexing saga.
//!
//! A create/update is applied to the relational index, then the search
//! index, then the graph store. If a stage fails, every stage already
//! committed is undone in reverse order by deleting what it wrote, and the
//! failure is reported as a [`SagaOutcome::Failed`] value. There is no
//! cross-store transaction; the relational index is the system of record,
//! so a frame that fails after compensation is simply "not indexed" and can
//! be retried from scratch.
//!
//! ```text
//! relational ──ok──► search ──ok──► graph ──ok──► Committed
//!     │err             │err           │err
//!     ▼                ▼              ▼
//!  Failed       undo relational   undo search, undo relational
//! ```
//!
//! Compensation is best-effort: a failing compensating delete is logged and
//! counted, never propagated.

use std::fmt;
use std::sync::Arc;

use lattice_core::{CommitFrame, EntityReference, OperationKind, Record};
use metrics::counter;
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::projection::{Projection, subject_entity};
use crate::store::{GraphStore, RelationalStore, SearchIndex};

/// One store write inside the saga, in commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexingStage {
    Relational,
    Search,
    Graph,
}

impl IndexingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Search => "search",
            Self::Graph => "graph",
        }
    }
}

impl fmt::Display for IndexingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaOutcome {
    /// Written to every listed stage.
    Committed { stages: Vec<IndexingStage> },
    /// Delete ran against every store; `failed` lists the stores that
    /// refused.
    Deleted {
        failed: Vec<(IndexingStage, StoreError)>,
    },
    /// A newer version is already indexed; nothing was written.
    Stale { indexed_seq: u64 },
    /// The record could not be projected; nothing was written.
    Rejected { reason: String },
    /// `stage` failed; `compensated` stages were undone (reverse order).
    Failed {
        stage: IndexingStage,
        error: StoreError,
        compensated: Vec<IndexingStage>,
    },
}

/// Writes records to the three stores with compensation.
pub struct IndexingSaga {
    relational: Arc<dyn RelationalStore>,
    search: Arc<dyn SearchIndex>,
    graph: Arc<dyn GraphStore>,
}

impl IndexingSaga {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        search: Arc<dyn SearchIndex>,
        graph: Arc<dyn GraphStore>,
    ) -> Self {
        Self {
            relational,
            search,
            graph,
        }
    }

    /// Apply a create or update.
    pub fn index(
        &self,
        frame: &CommitFrame,
        entity: &EntityReference,
        record: &Record,
    ) -> SagaOutcome {
        // Cross-store values are derived before any write.
        let indexed_seq = match self.relational.indexed_seq(entity) {
            Ok(seq) => seq,
            Err(e) => return self.fail(entity, IndexingStage::Relational, e, Vec::new()),
        };
        if let Some(indexed_seq) = indexed_seq
            && indexed_seq > frame.seq
        {
            debug!(entity = %entity, seq = frame.seq, indexed_seq, "Skipping stale frame");
            return SagaOutcome::Stale { indexed_seq };
        }

        let subject_title = match subject_entity(record) {
            Ok(Some(subject)) => match self.relational.title(&subject) {
                Ok(title) => title,
                Err(e) => return self.fail(entity, IndexingStage::Relational, e, Vec::new()),
            },
            Ok(None) => None,
            Err(e) => {
                return SagaOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
        };

        let projection = match Projection::build(frame, entity, record, subject_title) {
            Ok(projection) => projection,
            Err(e) => {
                return SagaOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
        };

        let mut committed = Vec::with_capacity(3);

        if let Err(e) = self.relational.upsert(&projection.row) {
            return self.fail(entity, IndexingStage::Relational, e, committed);
        }
        committed.push(IndexingStage::Relational);

        if let Err(e) = self.search.upsert(&projection.document) {
            return self.fail(entity, IndexingStage::Search, e, committed);
        }
        committed.push(IndexingStage::Search);

        // An update may have dropped all edges; upserting the empty
        // projection clears the ones the previous version owned.
        let needs_graph =
            !projection.graph.is_empty() || frame.operation == OperationKind::Update;
        if needs_graph {
            if let Err(e) = self.graph.upsert(entity, &projection.graph) {
                return self.fail(entity, IndexingStage::Graph, e, committed);
            }
            committed.push(IndexingStage::Graph);
        }

        SagaOutcome::Committed { stages: committed }
    }

    /// Remove an entity from every store. Per-store failures are logged and
    /// do not stop the remaining deletes.
    pub fn delete(&self, frame: &CommitFrame, entity: &EntityReference) -> SagaOutcome {
        match self.relational.indexed_seq(entity) {
            Ok(Some(indexed_seq)) if indexed_seq > frame.seq => {
                debug!(entity = %entity, seq = frame.seq, indexed_seq, "Skipping stale delete");
                return SagaOutcome::Stale { indexed_seq };
            }
            Ok(_) => {}
            Err(e) => {
                warn!(entity = %entity, error = %e, "Could not read indexed version before delete");
            }
        }

        let mut failed = Vec::new();

        if let Err(e) = self.relational.delete(entity) {
            failed.push((IndexingStage::Relational, e));
        }
        if let Err(e) = self.search.delete(entity) {
            failed.push((IndexingStage::Search, e));
        }
        if let Err(e) = self.graph.delete(entity) {
            failed.push((IndexingStage::Graph, e));
        }

        for (stage, e) in &failed {
            counter!("saga_delete_failures_total", "stage" => stage.as_str()).increment(1);
            warn!(entity = %entity, stage = %stage, error = %e, "Delete failed");
        }

        SagaOutcome::Deleted { failed }
    }

    fn fail(
        &self,
        entity: &EntityReference,
        stage: IndexingStage,
        error: StoreError,
        committed: Vec<IndexingStage>,
    ) -> SagaOutcome {
        counter!("saga_stage_failures_total", "stage" => stage.as_str()).increment(1);
        warn!(entity = %entity, stage = %stage, error = %error, "Indexing stage failed");

        let mut compensated = Vec::with_capacity(committed.len());
        for done in committed.into_iter().rev() {
            let result = match done {
                IndexingStage::Relational => self.relational.delete(entity).map(|_| ()),
                IndexingStage::Search => self.search.delete(entity),
                IndexingStage::Graph => self.graph.delete(entity),
            };

            match result {
                Ok(()) => {
                    counter!(
                        "saga_compensations_total",
                        "stage" => done.as_str(),
                        "result" => "ok"
                    )
                    .increment(1);
                }
                Err(comp_err) => {
                    counter!(
                        "saga_compensations_total",
                        "stage" => done.as_str(),
                        "result" => "error"
                    )
                    .increment(1);
                    error!(
                        entity = %entity,
                        stage = %done,
                        original_error = %error,
                        compensation_error = %comp_err,
                        "Compensation failed"
                    );
                }
            }
            compensated.push(done);
        }

        SagaOutcome::Failed {
            stage,
            error,
            compensated,
        }
    }
}
