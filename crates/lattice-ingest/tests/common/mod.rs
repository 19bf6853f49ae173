//! Shared fixtures for the pipeline integration tests.
//!
//! [`Harness`] opens the three real stores in a temporary directory and
//! wraps each in a fault injector, so a test can make any stage's writes or
//! deletes fail a given number of times with a given error kind.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lattice_core::{CommitFrame, EntityReference, OperationKind};
use lattice_ingest::error::{StoreError, StoreErrorKind, StoreResult};
use lattice_ingest::store::{
    GraphEdge, GraphNode, GraphProjection, RelationalRow, SearchDocument,
};
use lattice_ingest::{
    CursorManager, DeadLetterStore, Dispatcher, FrameProcessor, GraphStore, IndexingSaga,
    ProcessorConfig, RelationalStore, RocksGraphStore, SearchIndex, SqliteRelationalStore,
    TantivySearchIndex,
};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

/// Failure budget for one kind of store call.
#[derive(Default)]
pub struct Faults {
    remaining: AtomicUsize,
    kind: Mutex<Option<StoreErrorKind>>,
    writes: AtomicUsize,
}

impl Faults {
    /// Fail the next `times` writes with `kind`.
    pub fn fail(&self, times: usize, kind: StoreErrorKind) {
        *self.kind.lock() = Some(kind);
        self.remaining.store(times, Ordering::SeqCst);
    }

    /// Fail every write with `kind` until [`Faults::heal`].
    pub fn fail_always(&self, kind: StoreErrorKind) {
        self.fail(usize::MAX, kind);
    }

    pub fn heal(&self) {
        self.remaining.store(0, Ordering::SeqCst);
    }

    /// Calls seen so far, failed ones included.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self, store: &'static str) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let took = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match *self.kind.lock() {
            Some(kind) if took => Err(StoreError::new(store, kind, "injected fault")),
            _ => Ok(()),
        }
    }
}

pub struct FaultyRelational {
    pub inner: Arc<SqliteRelationalStore>,
    pub faults: Arc<Faults>,
    pub delete_faults: Arc<Faults>,
}

impl RelationalStore for FaultyRelational {
    fn upsert(&self, row: &RelationalRow) -> StoreResult<()> {
        self.faults.check("sqlite")?;
        self.inner.upsert(row)
    }

    fn delete(&self, entity: &EntityReference) -> StoreResult<bool> {
        self.delete_faults.check("sqlite")?;
        self.inner.delete(entity)
    }

    fn get(&self, entity: &EntityReference) -> StoreResult<Option<RelationalRow>> {
        self.inner.get(entity)
    }

    fn indexed_seq(&self, entity: &EntityReference) -> StoreResult<Option<u64>> {
        self.inner.indexed_seq(entity)
    }

    fn title(&self, entity: &EntityReference) -> StoreResult<Option<String>> {
        self.inner.title(entity)
    }
}

pub struct FaultySearch {
    pub inner: Arc<TantivySearchIndex>,
    pub faults: Arc<Faults>,
    pub delete_faults: Arc<Faults>,
}

impl SearchIndex for FaultySearch {
    fn upsert(&self, doc: &SearchDocument) -> StoreResult<()> {
        self.faults.check("tantivy")?;
        self.inner.upsert(doc)
    }

    fn delete(&self, entity: &EntityReference) -> StoreResult<()> {
        self.delete_faults.check("tantivy")?;
        self.inner.delete(entity)
    }

    fn get(&self, entity: &EntityReference) -> StoreResult<Option<SearchDocument>> {
        self.inner.get(entity)
    }
}

pub struct FaultyGraph {
    pub inner: Arc<RocksGraphStore>,
    pub faults: Arc<Faults>,
    pub delete_faults: Arc<Faults>,
}

impl GraphStore for FaultyGraph {
    fn upsert(&self, entity: &EntityReference, projection: &GraphProjection) -> StoreResult<()> {
        self.faults.check("rocksdb")?;
        self.inner.upsert(entity, projection)
    }

    fn delete(&self, entity: &EntityReference) -> StoreResult<()> {
        self.delete_faults.check("rocksdb")?;
        self.inner.delete(entity)
    }

    fn edges_owned_by(&self, entity: &EntityReference) -> StoreResult<Vec<GraphEdge>> {
        self.inner.edges_owned_by(entity)
    }

    fn node(&self, id: &str) -> StoreResult<Option<GraphNode>> {
        self.inner.node(id)
    }

    fn edges_from(&self, node_id: &str) -> StoreResult<Vec<GraphEdge>> {
        self.inner.edges_from(node_id)
    }
}

/// Real stores on disk behind fault injectors.
pub struct Harness {
    pub dir: TempDir,
    pub relational: Arc<SqliteRelationalStore>,
    pub search: Arc<TantivySearchIndex>,
    pub graph: Arc<RocksGraphStore>,
    pub relational_faults: Arc<Faults>,
    pub search_faults: Arc<Faults>,
    pub graph_faults: Arc<Faults>,
    pub relational_delete_faults: Arc<Faults>,
    pub search_delete_faults: Arc<Faults>,
    pub graph_delete_faults: Arc<Faults>,
    pub dead_letters: Arc<DeadLetterStore>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let relational =
            Arc::new(SqliteRelationalStore::open(&dir.path().join("relational.db")).unwrap());
        let search = Arc::new(TantivySearchIndex::open_in_ram().unwrap());
        let graph = Arc::new(RocksGraphStore::open(dir.path().join("graph")).unwrap());
        let dead_letters = Arc::new(DeadLetterStore::open(&dir.path().join("state.db")).unwrap());

        Self {
            dir,
            relational,
            search,
            graph,
            relational_faults: Arc::default(),
            search_faults: Arc::default(),
            graph_faults: Arc::default(),
            relational_delete_faults: Arc::default(),
            search_delete_faults: Arc::default(),
            graph_delete_faults: Arc::default(),
            dead_letters,
        }
    }

    pub fn saga(&self) -> IndexingSaga {
        IndexingSaga::new(
            Arc::new(FaultyRelational {
                inner: self.relational.clone(),
                faults: self.relational_faults.clone(),
                delete_faults: self.relational_delete_faults.clone(),
            }),
            Arc::new(FaultySearch {
                inner: self.search.clone(),
                faults: self.search_faults.clone(),
                delete_faults: self.search_delete_faults.clone(),
            }),
            Arc::new(FaultyGraph {
                inner: self.graph.clone(),
                faults: self.graph_faults.clone(),
                delete_faults: self.graph_delete_faults.clone(),
            }),
        )
    }

    /// Processor with `max_retries` and no retry delay.
    pub fn processor(&self, max_retries: u32) -> Arc<FrameProcessor> {
        let dispatcher = Dispatcher::with_default_handlers(Arc::new(self.saga()));
        Arc::new(FrameProcessor::new(
            Arc::new(dispatcher),
            self.dead_letters.clone(),
            ProcessorConfig {
                max_retries,
                retry_backoff: Duration::ZERO,
                max_retry_backoff: Duration::ZERO,
            },
        ))
    }

    pub fn cursor(&self) -> Arc<CursorManager> {
        Arc::new(CursorManager::open(&self.state_db(), "firehose_seq").unwrap())
    }

    pub fn state_db(&self) -> std::path::PathBuf {
        self.dir.path().join("state.db")
    }
}

pub const AUTHOR: &str = "did:plc:author";

/// Preprint commit for `rkey` with the given title and keywords.
pub fn preprint(
    seq: u64,
    operation: OperationKind,
    rkey: &str,
    title: &str,
    keywords: &[&str],
) -> CommitFrame {
    CommitFrame {
        seq,
        did: AUTHOR.to_string(),
        collection: "pub.lattice.preprint".to_string(),
        rkey: rkey.to_string(),
        operation,
        cid: Some(format!("bafyreicid{seq}")),
        record: Some(json!({
            "title": title,
            "keywords": keywords,
            "createdAt": "2024-01-01T00:00:00Z"
        })),
        rev: None,
    }
}

pub fn delete(seq: u64, rkey: &str) -> CommitFrame {
    CommitFrame {
        seq,
        did: AUTHOR.to_string(),
        collection: "pub.lattice.preprint".to_string(),
        rkey: rkey.to_string(),
        operation: OperationKind::Delete,
        cid: None,
        record: None,
        rev: None,
    }
}

/// Transport that plays back one script entry per connection attempt.
///
/// `Ok(frames)` connects and yields the frames, then reports the stream as
/// ended; `Err` fails the connect. Once the script runs out, `connect`
/// never completes.
pub struct ScriptedTransport {
    sessions: std::collections::VecDeque<Result<Vec<String>, String>>,
    current: std::collections::VecDeque<String>,
    pub cursors: Arc<Mutex<Vec<Option<u64>>>>,
}

impl ScriptedTransport {
    pub fn new(sessions: Vec<Result<Vec<String>, String>>) -> Self {
        Self {
            sessions: sessions.into(),
            current: Default::default(),
            cursors: Arc::default(),
        }
    }
}

#[async_trait::async_trait]
impl lattice_ingest::FirehoseTransport for ScriptedTransport {
    async fn connect(&mut self, cursor: Option<u64>) -> lattice_ingest::Result<()> {
        self.cursors.lock().push(cursor);
        match self.sessions.pop_front() {
            Some(Ok(frames)) => {
                self.current = frames.into();
                Ok(())
            }
            Some(Err(e)) => Err(lattice_ingest::Error::Transport(e)),
            None => std::future::pending().await,
        }
    }

    async fn next_frame(&mut self) -> lattice_ingest::Result<Option<lattice_ingest::RawFrame>> {
        Ok(self.current.pop_front().map(lattice_ingest::RawFrame))
    }

    async fn close(&mut self) {}
}

/// Jetstream JSON for a preprint commit.
pub fn jetstream_preprint(seq: u64, operation: &str, rkey: &str, title: &str) -> String {
    let mut commit = json!({
        "rev": "3l3qo2vutsw2b",
        "operation": operation,
        "collection": "pub.lattice.preprint",
        "rkey": rkey,
    });
    if operation != "delete" {
        commit["cid"] = json!(format!("bafyreicid{seq}"));
        commit["record"] = json!({
            "title": title,
            "keywords": ["firehose"],
            "createdAt": "2024-09-09T19:46:02.102Z"
        });
    }
    json!({"did": AUTHOR, "time_us": seq, "kind": "commit", "commit": commit}).to_string()
}
