//! Per-store projections of a decoded record.
//!
//! Cross-store values (subject title, normalized labels) are derived once and
//! reused for all three stores, so the stores never disagree about them.

use std::collections::HashSet;

use lattice_core::{CommitFrame, EntityReference, Record, normalize_tag};

use crate::error::FrameError;
use crate::store::{
    GraphEdge, GraphNode, GraphProjection, NodeKind, Relation, RelationalRow, SearchDocument,
    tag_node_id,
};

/// Everything the saga writes for one create/update.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub row: RelationalRow,
    pub document: SearchDocument,
    pub graph: GraphProjection,
}

/// Reference to the record a review, endorsement or tag points at.
pub fn subject_entity(record: &Record) -> Result<Option<EntityReference>, FrameError> {
    record
        .subject()
        .map(|subject| EntityReference::from_at_uri(&subject.uri).map_err(FrameError::from))
        .transpose()
}

impl Projection {
    /// Build the projections. `subject_title` is the indexed title of the
    /// record's subject, when it has one.
    pub fn build(
        frame: &CommitFrame,
        entity: &EntityReference,
        record: &Record,
        subject_title: Option<String>,
    ) -> Result<Self, FrameError> {
        let subject = subject_entity(record)?;
        let body = frame.record.clone().unwrap_or(serde_json::Value::Null);

        let (title, text, keywords) = match record {
            Record::Preprint(p) => {
                let authors: Vec<&str> = p.authors.iter().map(|a| a.name.as_str()).collect();
                let text = if authors.is_empty() {
                    p.abstract_text.clone()
                } else {
                    format!("{}\n{}", p.abstract_text, authors.join(", "))
                };
                (Some(p.title.clone()), text, labels(&p.keywords))
            }
            Record::Review(r) => (subject_title, r.text.clone(), Vec::new()),
            Record::Endorsement(e) => {
                let text = match &e.comment {
                    Some(comment) => format!("{}\n{}", comment, e.contributions.join(", ")),
                    None => e.contributions.join(", "),
                };
                (subject_title, text, labels(&e.contributions))
            }
            Record::UserTag(t) => {
                let keywords = labels(std::slice::from_ref(&t.tag));
                (subject_title, t.tag.clone(), keywords)
            }
        };

        let row = RelationalRow {
            entity: entity.clone(),
            did: frame.did.clone(),
            collection: frame.collection.clone(),
            rkey: frame.rkey.clone(),
            kind: record.kind(),
            cid: frame.cid.clone().unwrap_or_default(),
            seq: frame.seq,
            title: title.clone(),
            subject_uri: record.subject().map(|s| s.uri.clone()),
            record: body,
            created_at: record.created_at().to_string(),
        };

        let document = SearchDocument {
            entity: entity.clone(),
            did: frame.did.clone(),
            kind: record.kind(),
            title: title.unwrap_or_default(),
            body: text,
            keywords,
            seq: frame.seq,
        };

        let graph = graph_projection(frame, entity, record, subject.as_ref());

        Ok(Self {
            row,
            document,
            graph,
        })
    }
}

fn labels(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|k| normalize_tag(k))
        .filter(|k| !k.is_empty() && seen.insert(k.clone()))
        .collect()
}

fn record_node(entity: &EntityReference) -> GraphNode {
    GraphNode {
        id: entity.id().to_string(),
        kind: NodeKind::Record,
        name: entity.uri().to_string(),
    }
}

fn account_node(did: &str) -> GraphNode {
    GraphNode {
        id: did.to_string(),
        kind: NodeKind::Account,
        name: did.to_string(),
    }
}

fn tag_node(label: &str) -> GraphNode {
    GraphNode {
        id: tag_node_id(label),
        kind: NodeKind::Tag,
        name: label.to_string(),
    }
}

fn edge(from: &str, relation: Relation, to: &str) -> GraphEdge {
    GraphEdge {
        from: from.to_string(),
        relation,
        to: to.to_string(),
    }
}

fn graph_projection(
    frame: &CommitFrame,
    entity: &EntityReference,
    record: &Record,
    subject: Option<&EntityReference>,
) -> GraphProjection {
    let mut graph = GraphProjection::default();

    match (record, subject) {
        (Record::Preprint(p), _) => {
            let labels = labels(&p.keywords);
            let author_dids: Vec<&str> =
                p.authors.iter().filter_map(|a| a.did.as_deref()).collect();
            if labels.is_empty() && author_dids.is_empty() {
                return graph;
            }

            graph.nodes.push(record_node(entity));
            for label in &labels {
                graph.nodes.push(tag_node(label));
                graph.edges.push(edge(entity.id(), Relation::Tagged, &tag_node_id(label)));
            }
            for did in author_dids {
                graph.nodes.push(account_node(did));
                graph.edges.push(edge(did, Relation::Authored, entity.id()));
            }
        }
        (Record::Review(_), Some(subject)) => {
            graph.nodes.push(account_node(&frame.did));
            graph.nodes.push(record_node(subject));
            graph.edges.push(edge(&frame.did, Relation::Reviews, subject.id()));
        }
        (Record::Endorsement(_), Some(subject)) => {
            graph.nodes.push(account_node(&frame.did));
            graph.nodes.push(record_node(subject));
            graph.edges.push(edge(&frame.did, Relation::Endorses, subject.id()));
        }
        (Record::UserTag(t), Some(subject)) => {
            let label = normalize_tag(&t.tag);
            graph.nodes.push(record_node(subject));
            graph.nodes.push(tag_node(&label));
            graph.edges.push(edge(subject.id(), Relation::Tagged, &tag_node_id(&label)));
        }
        _ => {}
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::{OperationKind, RecordKind};
    use serde_json::{Value, json};

    fn frame(collection: &str, body: Value) -> CommitFrame {
        CommitFrame {
            seq: 42,
            did: "did:plc:writer".to_string(),
            collection: collection.to_string(),
            rkey: "r1".to_string(),
            operation: OperationKind::Create,
            cid: Some("bafyreiabcdefgh".to_string()),
            record: Some(body),
            rev: None,
        }
    }

    fn build(kind: RecordKind, body: Value, subject_title: Option<&str>) -> Projection {
        let f = frame(kind.nsid(), body);
        let record = Record::decode(kind, f.record.as_ref().unwrap()).unwrap();
        Projection::build(&f, &f.entity_ref(), &record, subject_title.map(str::to_string)).unwrap()
    }

    #[test]
    fn test_preprint_projection() {
        let p = build(
            RecordKind::Preprint,
            json!({
                "title": "On Sagas",
                "abstract": "Compensation.",
                "authors": [{"name": "Ada", "did": "did:plc:ada"}, {"name": "Anon"}],
                "keywords": ["Distributed Systems", "distributed  systems", "Rust"],
                "createdAt": "2024-01-01T00:00:00Z"
            }),
            None,
        );

        assert_eq!(p.row.title.as_deref(), Some("On Sagas"));
        assert_eq!(p.row.seq, 42);
        assert_eq!(p.document.keywords, vec!["distributed-systems", "rust"]);
        assert!(p.document.body.contains("Ada, Anon"));

        let relations: Vec<Relation> = p.graph.edges.iter().map(|e| e.relation).collect();
        assert_eq!(
            relations,
            vec![Relation::Tagged, Relation::Tagged, Relation::Authored]
        );
        assert_eq!(p.graph.edges[2].from, "did:plc:ada");
    }

    #[test]
    fn test_bare_preprint_has_no_graph_data() {
        let p = build(
            RecordKind::Preprint,
            json!({"title": "Alone", "createdAt": "2024-01-01T00:00:00Z"}),
            None,
        );
        assert!(p.graph.is_empty());
    }

    #[test]
    fn test_review_uses_subject_title() {
        let subject_uri = "at://did:plc:author/pub.lattice.preprint/p1";
        let p = build(
            RecordKind::Review,
            json!({
                "subject": {"uri": subject_uri, "cid": "bafyabc"},
                "text": "Solid work",
                "createdAt": "2024-01-01T00:00:00Z"
            }),
            Some("On Sagas"),
        );

        let subject = EntityReference::from_at_uri(subject_uri).unwrap();
        assert_eq!(p.row.title.as_deref(), Some("On Sagas"));
        assert_eq!(p.row.subject_uri.as_deref(), Some(subject_uri));
        assert_eq!(p.document.title, "On Sagas");
        assert_eq!(
            p.graph.edges,
            vec![GraphEdge {
                from: "did:plc:writer".to_string(),
                relation: Relation::Reviews,
                to: subject.id().to_string(),
            }]
        );
    }

    #[test]
    fn test_user_tag_edge_on_subject() {
        let subject_uri = "at://did:plc:author/pub.lattice.preprint/p1";
        let p = build(
            RecordKind::UserTag,
            json!({
                "subject": {"uri": subject_uri, "cid": "bafyabc"},
                "tag": "Machine Learning",
                "createdAt": "2024-01-01T00:00:00Z"
            }),
            None,
        );

        let subject = EntityReference::from_at_uri(subject_uri).unwrap();
        assert_eq!(p.graph.edges.len(), 1);
        assert_eq!(p.graph.edges[0].from, subject.id());
        assert_eq!(p.graph.edges[0].to, tag_node_id("machine-learning"));
        assert_eq!(p.document.keywords, vec!["machine-learning"]);
    }
}
