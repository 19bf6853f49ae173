//! Store contracts and their on-disk implementations.
//!
//! Each store is keyed by [`EntityReference`] and upserts idempotently, so
//! replaying a frame converges to the same state. Calls are blocking and
//! implementations are internally synchronised; the pipeline shares them
//! across worker lanes behind `Arc`.
//!
//! | Store        | Trait               | Implementation                  |
//! |--------------|---------------------|---------------------------------|
//! | relational   | [`RelationalStore`] | [`SqliteRelationalStore`]       |
//! | search       | [`SearchIndex`]     | [`TantivySearchIndex`]          |
//! | graph        | [`GraphStore`]      | [`RocksGraphStore`]             |

pub mod graph;
pub mod relational;
pub mod search;

use std::path::Path;
use std::sync::Arc;

use lattice_core::{EntityReference, RecordKind};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::StoreResult;
use crate::saga::IndexingSaga;

pub use graph::RocksGraphStore;
pub use relational::SqliteRelationalStore;
pub use search::TantivySearchIndex;

/// A record as held by the relational index.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationalRow {
    pub entity: EntityReference,
    pub did: String,
    pub collection: String,
    pub rkey: String,
    pub kind: RecordKind,
    pub cid: String,
    /// Sequence of the frame that produced this version.
    pub seq: u64,
    /// Preprint title, or the subject preprint's title for dependent records.
    pub title: Option<String>,
    pub subject_uri: Option<String>,
    pub record: serde_json::Value,
    pub created_at: String,
}

/// A record as held by the full-text index.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchDocument {
    pub entity: EntityReference,
    pub did: String,
    pub kind: RecordKind,
    pub title: String,
    pub body: String,
    pub keywords: Vec<String>,
    pub seq: u64,
}

/// Edge type in the graph store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Tagged,
    Authored,
    Reviews,
    Endorses,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tagged => "tagged",
            Self::Authored => "authored",
            Self::Reviews => "reviews",
            Self::Endorses => "endorses",
        }
    }
}

impl std::str::FromStr for Relation {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tagged" => Ok(Self::Tagged),
            "authored" => Ok(Self::Authored),
            "reviews" => Ok(Self::Reviews),
            "endorses" => Ok(Self::Endorses),
            _ => Err(()),
        }
    }
}

/// Vertex kind in the graph store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// An indexed record, keyed by its entity id.
    Record,
    /// An account, keyed by DID.
    Account,
    /// A normalized tag label, keyed by `tag:<label>`.
    Tag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub relation: Relation,
    pub to: String,
}

/// Nodes and edges contributed by one entity.
///
/// Edges are owned by the entity: replacing or deleting the entity replaces
/// or removes exactly these edges. Nodes are shared and outlive the entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphProjection {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphProjection {
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Node id for a tag label.
pub fn tag_node_id(label: &str) -> String {
    format!("tag:{label}")
}

/// The three on-disk stores under one data directory.
///
/// ```text
/// {data_dir}/relational.db   SQLite
/// {data_dir}/search/         Tantivy
/// {data_dir}/graph/          RocksDB (exclusive lock while open)
/// ```
pub struct Stores {
    pub relational: Arc<SqliteRelationalStore>,
    pub search: Arc<TantivySearchIndex>,
    pub graph: Arc<RocksGraphStore>,
}

impl Stores {
    pub fn open(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            relational: Arc::new(SqliteRelationalStore::open(&data_dir.join("relational.db"))?),
            search: Arc::new(TantivySearchIndex::open(&data_dir.join("search"))?),
            graph: Arc::new(RocksGraphStore::open(data_dir.join("graph"))?),
        })
    }

    /// Saga writing to these stores.
    pub fn saga(&self) -> IndexingSaga {
        IndexingSaga::new(
            self.relational.clone(),
            self.search.clone(),
            self.graph.clone(),
        )
    }
}

/// System of record for "is this entity indexed".
pub trait RelationalStore: Send + Sync {
    fn upsert(&self, row: &RelationalRow) -> StoreResult<()>;

    /// Returns whether a row existed.
    fn delete(&self, entity: &EntityReference) -> StoreResult<bool>;

    fn get(&self, entity: &EntityReference) -> StoreResult<Option<RelationalRow>>;

    /// Sequence of the indexed version, if any.
    fn indexed_seq(&self, entity: &EntityReference) -> StoreResult<Option<u64>>;

    /// Title of an indexed record, if any.
    fn title(&self, entity: &EntityReference) -> StoreResult<Option<String>>;
}

pub trait SearchIndex: Send + Sync {
    fn upsert(&self, doc: &SearchDocument) -> StoreResult<()>;

    fn delete(&self, entity: &EntityReference) -> StoreResult<()>;

    fn get(&self, entity: &EntityReference) -> StoreResult<Option<SearchDocument>>;
}

pub trait GraphStore: Send + Sync {
    /// Replace the edges owned by `entity` and merge its nodes.
    fn upsert(&self, entity: &EntityReference, projection: &GraphProjection) -> StoreResult<()>;

    /// Remove the edges owned by `entity` and its record node.
    fn delete(&self, entity: &EntityReference) -> StoreResult<()>;

    fn edges_owned_by(&self, entity: &EntityReference) -> StoreResult<Vec<GraphEdge>>;

    fn node(&self, id: &str) -> StoreResult<Option<GraphNode>>;

    /// Outgoing edges of a node, across all owners.
    fn edges_from(&self, node_id: &str) -> StoreResult<Vec<GraphEdge>>;
}
