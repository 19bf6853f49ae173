//! RocksDB graph store.
//!
//! # Key Design
//!
//! All keys are UTF-8 with NUL separators:
//!
//! - `n\0{node}` → JSON [`GraphNode`]
//! - `e\0{from}\0{relation}\0{to}\0{owner}` → empty (one row per owned edge)
//! - `o\0{owner}` → JSON list of the owner's edges
//!
//! Keeping the owner in the edge key lets two entities assert the same
//! relationship independently. The `o` row makes replace and delete a single
//! [`WriteBatch`] without scanning.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use lattice_core::EntityReference;
use rocksdb::{
    DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use tracing::{debug, info};

use super::{GraphEdge, GraphNode, GraphProjection, GraphStore, Relation};
use crate::Result;
use crate::error::{StoreError, StoreErrorKind, StoreResult};

const SEP: char = '\0';

fn node_key(id: &str) -> String {
    format!("n{SEP}{id}")
}

fn owner_key(owner: &str) -> String {
    format!("o{SEP}{owner}")
}

fn edge_key(edge: &GraphEdge, owner: &str) -> String {
    format!(
        "e{SEP}{}{SEP}{}{SEP}{}{SEP}{owner}",
        edge.from,
        edge.relation.as_str(),
        edge.to
    )
}

fn parse_edge_key(key: &[u8]) -> StoreResult<GraphEdge> {
    let corrupt = || {
        StoreError::new(
            "rocksdb",
            StoreErrorKind::Schema,
            format!("malformed edge key {:?}", String::from_utf8_lossy(key)),
        )
    };

    let key = std::str::from_utf8(key).map_err(|_| corrupt())?;
    let mut parts = key.split(SEP);
    let (Some("e"), Some(from), Some(relation), Some(to), Some(_owner)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(corrupt());
    };

    Ok(GraphEdge {
        from: from.to_string(),
        relation: Relation::from_str(relation).map_err(|_| corrupt())?,
        to: to.to_string(),
    })
}

/// RocksDB-backed [`GraphStore`].
///
/// Thread-safe: share across lanes via `Arc<RocksGraphStore>`.
pub struct RocksGraphStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksGraphStore {
    /// Open or create a graph store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening graph store at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);

        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.increase_parallelism(num_cpus::get() as i32);

        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path).map_err(StoreError::from)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn owned_edges(&self, owner: &str) -> StoreResult<Vec<GraphEdge>> {
        match self.db.get(owner_key(owner))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn write(&self, batch: WriteBatch) -> StoreResult<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Approximate number of keys, for diagnostics.
    pub fn approximate_keys(&self) -> u64 {
        self.db
            .property_int_value("rocksdb.estimate-num-keys")
            .ok()
            .flatten()
            .unwrap_or(0)
    }
}

impl GraphStore for RocksGraphStore {
    fn upsert(&self, entity: &EntityReference, projection: &GraphProjection) -> StoreResult<()> {
        let owner = entity.id();
        let previous = self.owned_edges(owner)?;

        let mut batch = WriteBatch::default();
        for edge in &previous {
            batch.delete(edge_key(edge, owner));
        }
        for node in &projection.nodes {
            batch.put(node_key(&node.id), serde_json::to_vec(node)?);
        }
        for edge in &projection.edges {
            batch.put(edge_key(edge, owner), b"");
        }
        batch.put(owner_key(owner), serde_json::to_vec(&projection.edges)?);

        self.write(batch)?;
        debug!(
            "Graph upsert for {}: {} edges replaced by {}",
            entity,
            previous.len(),
            projection.edges.len()
        );
        Ok(())
    }

    fn delete(&self, entity: &EntityReference) -> StoreResult<()> {
        let owner = entity.id();
        let previous = self.owned_edges(owner)?;

        let mut batch = WriteBatch::default();
        for edge in &previous {
            batch.delete(edge_key(edge, owner));
        }
        batch.delete(owner_key(owner));
        batch.delete(node_key(owner));

        self.write(batch)
    }

    fn edges_owned_by(&self, entity: &EntityReference) -> StoreResult<Vec<GraphEdge>> {
        self.owned_edges(entity.id())
    }

    fn node(&self, id: &str) -> StoreResult<Option<GraphNode>> {
        match self.db.get(node_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn edges_from(&self, node_id: &str) -> StoreResult<Vec<GraphEdge>> {
        let prefix = format!("e{SEP}{node_id}{SEP}");
        let mut edges = Vec::new();

        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let edge = parse_edge_key(&key)?;
            if !edges.contains(&edge) {
                edges.push(edge);
            }
        }

        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NodeKind, tag_node_id};
    use tempfile::TempDir;

    fn preprint() -> EntityReference {
        EntityReference::new("did:plc:author", "pub.lattice.preprint", "p1")
    }

    fn tagged(entity: &EntityReference, label: &str) -> GraphProjection {
        GraphProjection {
            nodes: vec![
                GraphNode {
                    id: entity.id().to_string(),
                    kind: NodeKind::Record,
                    name: entity.uri().to_string(),
                },
                GraphNode {
                    id: tag_node_id(label),
                    kind: NodeKind::Tag,
                    name: label.to_string(),
                },
            ],
            edges: vec![GraphEdge {
                from: entity.id().to_string(),
                relation: Relation::Tagged,
                to: tag_node_id(label),
            }],
        }
    }

    #[test]
    fn test_upsert_replaces_owned_edges() {
        let dir = TempDir::new().unwrap();
        let store = RocksGraphStore::open(dir.path()).unwrap();
        let entity = preprint();

        store.upsert(&entity, &tagged(&entity, "rust")).unwrap();
        store.upsert(&entity, &tagged(&entity, "sagas")).unwrap();
        store.upsert(&entity, &tagged(&entity, "sagas")).unwrap();

        let edges = store.edges_owned_by(&entity).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, tag_node_id("sagas"));
        assert_eq!(store.edges_from(entity.id()).unwrap(), edges);

        // Nodes are shared and outlive the edges that pointed at them.
        assert!(store.node(&tag_node_id("rust")).unwrap().is_some());
    }

    #[test]
    fn test_delete_removes_edges_and_record_node() {
        let dir = TempDir::new().unwrap();
        let store = RocksGraphStore::open(dir.path()).unwrap();
        let entity = preprint();

        store.upsert(&entity, &tagged(&entity, "rust")).unwrap();
        store.delete(&entity).unwrap();
        store.delete(&entity).unwrap();

        assert!(store.edges_owned_by(&entity).unwrap().is_empty());
        assert!(store.edges_from(entity.id()).unwrap().is_empty());
        assert!(store.node(entity.id()).unwrap().is_none());
        assert!(store.node(&tag_node_id("rust")).unwrap().is_some());
    }

    #[test]
    fn test_same_edge_from_two_owners() {
        let dir = TempDir::new().unwrap();
        let store = RocksGraphStore::open(dir.path()).unwrap();
        let subject = preprint();
        let tag_a = EntityReference::new("did:plc:a", "pub.lattice.tag", "t1");
        let tag_b = EntityReference::new("did:plc:b", "pub.lattice.tag", "t1");

        let projection = tagged(&subject, "rust");
        store.upsert(&tag_a, &projection).unwrap();
        store.upsert(&tag_b, &projection).unwrap();

        store.delete(&tag_a).unwrap();
        assert_eq!(store.edges_from(subject.id()).unwrap().len(), 1);

        store.delete(&tag_b).unwrap();
        assert!(store.edges_from(subject.id()).unwrap().is_empty());
    }

    #[test]
    fn test_parse_edge_key_roundtrip() {
        let edge = GraphEdge {
            from: "did:plc:x".to_string(),
            relation: Relation::Reviews,
            to: "abc".to_string(),
        };
        let key = edge_key(&edge, "owner");
        assert_eq!(parse_edge_key(key.as_bytes()).unwrap(), edge);
        assert!(parse_edge_key(b"e\0only").is_err());
    }
}
