//! Tantivy full-text index.
//!
//! One document per entity, keyed by the raw-tokenized `id` field. An upsert
//! deletes the old document by term and adds the new one in a single commit.
//! A failed write rolls the writer back, so nothing it queued can be
//! published by a later commit.

use std::path::Path;
use std::str::FromStr;

use lattice_core::{EntityReference, RecordKind};
use parking_lot::Mutex;
use tantivy::collector::TopDocs;
use tantivy::query::{QueryParser, TermQuery};
use tantivy::schema::{
    Field, INDEXED, IndexRecordOption, STORED, Schema, TEXT, TantivyDocument, TextFieldIndexing,
    TextOptions, Value,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Term, doc};
use tracing::{info, warn};

use super::{SearchDocument, SearchIndex};
use crate::Result;
use crate::error::{StoreError, StoreErrorKind, StoreResult};

/// Documents are committed one at a time, so one indexing thread suffices.
const WRITER_HEAP_BYTES: usize = 50_000_000;

#[derive(Debug, Clone, Copy)]
struct Fields {
    id: Field,
    uri: Field,
    did: Field,
    kind: Field,
    title: Field,
    body: Field,
    keywords: Field,
    seq: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();

    let exact = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("raw")
                .set_index_option(IndexRecordOption::Basic),
        )
        .set_stored();

    let fields = Fields {
        id: builder.add_text_field("id", exact.clone()),
        uri: builder.add_text_field("uri", exact.clone()),
        did: builder.add_text_field("did", exact.clone()),
        kind: builder.add_text_field("kind", exact),
        title: builder.add_text_field("title", TEXT | STORED),
        body: builder.add_text_field("body", TEXT | STORED),
        keywords: builder.add_text_field("keywords", TEXT | STORED),
        seq: builder.add_u64_field("seq", INDEXED | STORED),
    };

    (builder.build(), fields)
}

/// Tantivy-backed [`SearchIndex`].
pub struct TantivySearchIndex {
    index: Index,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    fields: Fields,
}

impl TantivySearchIndex {
    /// Open or create an index in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        info!("Opening search index at {}", dir.display());

        let (schema, fields) = build_schema();
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir).map_err(StoreError::from)?
        } else {
            Index::create_in_dir(dir, schema).map_err(StoreError::from)?
        };
        Ok(Self::from_index(index, fields)?)
    }

    /// Open an in-RAM index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        Ok(Self::from_index(Index::create_in_ram(schema), fields)?)
    }

    fn from_index(index: Index, fields: Fields) -> StoreResult<Self> {
        let writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            index,
            writer: Mutex::new(writer),
            reader,
            fields,
        })
    }

    /// Free-text query over title, body and keywords, best matches first.
    pub fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<SearchDocument>> {
        let parser = QueryParser::for_index(
            &self.index,
            vec![self.fields.title, self.fields.body, self.fields.keywords],
        );
        let query = parser.parse_query(query).map_err(|e| {
            StoreError::new("tantivy", StoreErrorKind::Validation, e.to_string())
        })?;

        let searcher = self.reader.searcher();
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;
        top_docs
            .into_iter()
            .map(|(_, address)| {
                let doc: TantivyDocument = searcher.doc(address)?;
                self.decode(&doc)
            })
            .collect()
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Queue `ops` and commit them, or roll every queued operation back.
    fn write<F>(&self, ops: F) -> StoreResult<()>
    where
        F: FnOnce(&IndexWriter) -> tantivy::Result<()>,
    {
        let mut writer = self.writer.lock();
        let written = ops(&*writer).and_then(|()| writer.commit().map(|_| ()));
        if let Err(e) = written {
            if let Err(rollback) = writer.rollback() {
                warn!("Search index rollback failed after '{}': {}", e, rollback);
            }
            return Err(e.into());
        }
        drop(writer);

        // The commit is durable at this point; a stale reader catches up on
        // the next successful reload.
        if let Err(e) = self.reader.reload() {
            warn!("Search reader reload failed: {}", e);
        }
        Ok(())
    }

    fn id_term(&self, entity: &EntityReference) -> Term {
        Term::from_field_text(self.fields.id, entity.id())
    }

    fn decode(&self, doc: &TantivyDocument) -> StoreResult<SearchDocument> {
        let text = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let uri = text(self.fields.uri);
        let entity = EntityReference::from_at_uri(&uri).map_err(|e| {
            StoreError::new("tantivy", StoreErrorKind::Schema, e.to_string())
        })?;
        let kind_name = text(self.fields.kind);
        let kind = RecordKind::from_str(&kind_name).map_err(|_| {
            StoreError::new(
                "tantivy",
                StoreErrorKind::Schema,
                format!("unknown record kind '{kind_name}' for {uri}"),
            )
        })?;

        Ok(SearchDocument {
            entity,
            did: text(self.fields.did),
            kind,
            title: text(self.fields.title),
            body: text(self.fields.body),
            keywords: doc
                .get_all(self.fields.keywords)
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
            seq: doc
                .get_first(self.fields.seq)
                .and_then(|v| v.as_u64())
                .unwrap_or_default(),
        })
    }
}

impl SearchIndex for TantivySearchIndex {
    fn upsert(&self, document: &SearchDocument) -> StoreResult<()> {
        let f = self.fields;
        let mut doc = doc!(
            f.id => document.entity.id(),
            f.uri => document.entity.uri(),
            f.did => document.did.as_str(),
            f.kind => document.kind.as_str(),
            f.title => document.title.as_str(),
            f.body => document.body.as_str(),
            f.seq => document.seq
        );
        for keyword in &document.keywords {
            doc.add_text(f.keywords, keyword);
        }

        let id = self.id_term(&document.entity);
        self.write(move |writer| {
            writer.delete_term(id);
            writer.add_document(doc)?;
            Ok(())
        })
    }

    fn delete(&self, entity: &EntityReference) -> StoreResult<()> {
        let id = self.id_term(entity);
        self.write(move |writer| {
            writer.delete_term(id);
            Ok(())
        })
    }

    fn get(&self, entity: &EntityReference) -> StoreResult<Option<SearchDocument>> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(self.id_term(entity), IndexRecordOption::Basic);
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;

        match top.first() {
            Some((_, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                self.decode(&doc).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn document(seq: u64, title: &str) -> SearchDocument {
        SearchDocument {
            entity: EntityReference::new("did:plc:abc", "pub.lattice.preprint", "p1"),
            did: "did:plc:abc".to_string(),
            kind: RecordKind::Preprint,
            title: title.to_string(),
            body: "Compensating transactions across heterogeneous stores".to_string(),
            keywords: vec!["sagas".to_string(), "distributed-systems".to_string()],
            seq,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let index = TantivySearchIndex::open_in_ram().unwrap();
        let doc = document(100, "Sagas in practice");
        index.upsert(&doc).unwrap();

        assert_eq!(index.get(&doc.entity).unwrap(), Some(doc));
        assert_eq!(index.num_docs(), 1);
    }

    #[test]
    fn test_upsert_replaces_document() {
        let index = TantivySearchIndex::open_in_ram().unwrap();
        index.upsert(&document(100, "Draft")).unwrap();
        index.upsert(&document(101, "Final")).unwrap();
        index.upsert(&document(101, "Final")).unwrap();

        assert_eq!(index.num_docs(), 1);
        let stored = index.get(&document(0, "").entity).unwrap().unwrap();
        assert_eq!(stored.title, "Final");
        assert_eq!(stored.seq, 101);
    }

    #[test]
    fn test_delete() {
        let index = TantivySearchIndex::open_in_ram().unwrap();
        let doc = document(1, "Gone soon");
        index.upsert(&doc).unwrap();
        index.delete(&doc.entity).unwrap();
        index.delete(&doc.entity).unwrap();

        assert_eq!(index.get(&doc.entity).unwrap(), None);
        assert_eq!(index.num_docs(), 0);
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let index = TantivySearchIndex::open_in_ram().unwrap();
        let kept = document(1, "Kept");
        index.upsert(&kept).unwrap();

        let mut orphan = document(2, "Orphan");
        orphan.entity = EntityReference::new("did:plc:abc", "pub.lattice.preprint", "p2");
        let f = index.fields;
        let result = index.write(|writer| {
            writer.delete_term(index.id_term(&kept.entity));
            writer.add_document(doc!(
                f.id => orphan.entity.id(),
                f.uri => orphan.entity.uri(),
                f.title => orphan.title.as_str()
            ))?;
            Err(tantivy::TantivyError::InternalError("disk full".to_string()))
        });
        assert!(result.is_err());

        // A later commit must not publish what the failed write queued.
        let mut other = document(3, "Other");
        other.entity = EntityReference::new("did:plc:abc", "pub.lattice.preprint", "p3");
        index.upsert(&other).unwrap();

        assert_eq!(index.get(&orphan.entity).unwrap(), None);
        assert_eq!(index.get(&kept.entity).unwrap(), Some(kept));
        assert_eq!(index.num_docs(), 2);
    }

    #[test]
    fn test_search_matches_text() {
        let index = TantivySearchIndex::open_in_ram().unwrap();
        index.upsert(&document(1, "Sagas in practice")).unwrap();

        let hits = index.search("heterogeneous", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Sagas in practice");
        assert!(index.search("blockchain", 10).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_on_disk() {
        let dir = TempDir::new().unwrap();
        let doc = document(3, "Persistent");
        {
            let index = TantivySearchIndex::open(dir.path()).unwrap();
            index.upsert(&doc).unwrap();
        }
        let index = TantivySearchIndex::open(dir.path()).unwrap();
        assert_eq!(index.get(&doc.entity).unwrap().map(|d| d.seq), Some(3));
    }
}
