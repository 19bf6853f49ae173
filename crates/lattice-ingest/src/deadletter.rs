//! Durable holding store for frames that could not be indexed.
//!
//! Entries are written by the frame processor once a frame exhausts its retry
//! budget or fails terminally. Operators list them and requeue them through
//! the processor (see [`crate::pipeline::FrameProcessor::requeue`]).

use std::path::Path;
use std::str::FromStr;

use lattice_core::CommitFrame;
use metrics::gauge;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::classify::Classification;
use crate::error::FrameError;
use crate::{Error, Result, schema};

/// One dead-lettered frame with its failure context.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: i64,
    pub frame: CommitFrame,
    /// Human-readable description of the last failure.
    pub reason: String,
    /// Failure taxonomy label (e.g., "poison_frame").
    pub error_label: String,
    #[serde(serialize_with = "serialize_classification")]
    pub classification: Classification,
    /// Retries performed so far, including failed requeues.
    pub retry_count: u32,
    /// Unix seconds.
    pub first_failed_at: i64,
    /// Unix seconds.
    pub last_failed_at: i64,
}

fn serialize_classification<S: serde::Serializer>(
    c: &Classification,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(c.as_str())
}

/// SQLite-backed dead-letter store.
pub struct DeadLetterStore {
    conn: Mutex<Connection>,
}

impl DeadLetterStore {
    /// Open the dead-letter table in the state database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(schema::open_state_db(path)?),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(schema::open_state_db_in_memory()?),
        })
    }

    /// Store a frame with its failure context. Returns the new entry id.
    pub fn dead_letter(
        &self,
        frame: &CommitFrame,
        error: &FrameError,
        classification: Classification,
        retry_count: u32,
    ) -> Result<i64> {
        let now = schema::unix_now();
        let frame_json = serde_json::to_string(frame)?;
        let uri = frame.entity_ref().uri().to_string();

        let id = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO dead_letters
                    (seq, uri, operation, frame, reason, error_label, classification,
                     retry_count, first_failed_at, last_failed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    frame.seq as i64,
                    uri,
                    frame.operation.as_str(),
                    frame_json,
                    error.to_string(),
                    error.label(),
                    classification.as_str(),
                    retry_count,
                    now,
                    now,
                ],
            )?;
            conn.last_insert_rowid()
        };

        self.update_backlog_gauge();
        Ok(id)
    }

    /// Entries ordered oldest first.
    pub fn list_entries(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, frame, reason, error_label, classification, retry_count,
                    first_failed_at, last_failed_at
             FROM dead_letters
             ORDER BY first_failed_at, id
             LIMIT ? OFFSET ?",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64, offset as i64], raw_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawEntry::decode).collect()
    }

    pub fn get(&self, id: i64) -> Result<Option<DeadLetterEntry>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id, frame, reason, error_label, classification, retry_count,
                        first_failed_at, last_failed_at
                 FROM dead_letters WHERE id = ?",
                [id],
                raw_entry,
            )
            .optional()?
        };
        raw.map(RawEntry::decode).transpose()
    }

    /// Entries recorded for one AT-URI.
    pub fn entries_for_uri(&self, uri: &str) -> Result<Vec<DeadLetterEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, frame, reason, error_label, classification, retry_count,
                    first_failed_at, last_failed_at
             FROM dead_letters WHERE uri = ?
             ORDER BY seq, id",
        )?;
        let rows = stmt
            .query_map([uri], raw_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawEntry::decode).collect()
    }

    /// Record another failed attempt on an existing entry.
    pub fn record_failure(
        &self,
        id: i64,
        error: &FrameError,
        classification: Classification,
    ) -> Result<()> {
        let changed = {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE dead_letters SET
                    retry_count = retry_count + 1,
                    last_failed_at = ?,
                    reason = ?,
                    error_label = ?,
                    classification = ?
                 WHERE id = ?",
                rusqlite::params![
                    schema::unix_now(),
                    error.to_string(),
                    error.label(),
                    classification.as_str(),
                    id
                ],
            )?
        };
        if changed == 0 {
            return Err(Error::EntryNotFound(id));
        }
        Ok(())
    }

    /// Delete an entry. Returns whether it existed.
    pub fn remove(&self, id: i64) -> Result<bool> {
        let changed = {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM dead_letters WHERE id = ?", [id])?
        };
        self.update_backlog_gauge();
        Ok(changed > 0)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn update_backlog_gauge(&self) {
        if let Ok(count) = self.count() {
            gauge!("deadletter_backlog").set(count as f64);
        }
    }
}

struct RawEntry {
    id: i64,
    frame: String,
    reason: String,
    error_label: String,
    classification: String,
    retry_count: u32,
    first_failed_at: i64,
    last_failed_at: i64,
}

fn raw_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        id: row.get(0)?,
        frame: row.get(1)?,
        reason: row.get(2)?,
        error_label: row.get(3)?,
        classification: row.get(4)?,
        retry_count: row.get(5)?,
        first_failed_at: row.get(6)?,
        last_failed_at: row.get(7)?,
    })
}

impl RawEntry {
    fn decode(self) -> Result<DeadLetterEntry> {
        let frame: CommitFrame = serde_json::from_str(&self.frame)?;
        let classification = Classification::from_str(&self.classification).map_err(|_| {
            Error::Serialization(format!(
                "unknown classification '{}' on dead letter {}",
                self.classification, self.id
            ))
        })?;
        Ok(DeadLetterEntry {
            id: self.id,
            frame,
            reason: self.reason,
            error_label: self.error_label,
            classification,
            retry_count: self.retry_count,
            first_failed_at: self.first_failed_at,
            last_failed_at: self.last_failed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::OperationKind;
    use serde_json::json;

    fn frame(seq: u64, rkey: &str) -> CommitFrame {
        CommitFrame {
            seq,
            did: "did:plc:abc".to_string(),
            collection: "pub.lattice.preprint".to_string(),
            rkey: rkey.to_string(),
            operation: OperationKind::Create,
            cid: Some("bafyreiabcdefgh".to_string()),
            record: Some(json!({"title": "x", "createdAt": "2024-01-01T00:00:00Z"})),
            rev: None,
        }
    }

    fn validation(msg: &str) -> FrameError {
        FrameError::ValidationFailure(msg.to_string())
    }

    #[test]
    fn test_dead_letter_and_get() {
        let store = DeadLetterStore::open_in_memory().unwrap();
        let id = store
            .dead_letter(&frame(100, "k1"), &validation("bad title"), Classification::Terminal, 0)
            .unwrap();

        let entry = store.get(id).unwrap().unwrap();
        assert_eq!(entry.frame, frame(100, "k1"));
        assert_eq!(entry.classification, Classification::Terminal);
        assert_eq!(entry.error_label, "validation_failure");
        assert!(entry.reason.contains("bad title"));
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.first_failed_at, entry.last_failed_at);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_list_is_oldest_first() {
        let store = DeadLetterStore::open_in_memory().unwrap();
        let first = store
            .dead_letter(&frame(1, "a"), &validation("x"), Classification::Terminal, 0)
            .unwrap();
        let second = store
            .dead_letter(&frame(2, "b"), &validation("y"), Classification::Terminal, 0)
            .unwrap();

        let ids: Vec<i64> = store
            .list_entries(10, 0)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![first, second]);

        let page: Vec<i64> = store
            .list_entries(1, 1)
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(page, vec![second]);
    }

    #[test]
    fn test_record_failure_bumps_retry_count() {
        let store = DeadLetterStore::open_in_memory().unwrap();
        let id = store
            .dead_letter(&frame(1, "a"), &validation("x"), Classification::Retryable, 3)
            .unwrap();

        store
            .record_failure(id, &validation("still bad"), Classification::Terminal)
            .unwrap();

        let entry = store.get(id).unwrap().unwrap();
        assert_eq!(entry.retry_count, 4);
        assert_eq!(entry.classification, Classification::Terminal);
        assert!(entry.reason.contains("still bad"));

        assert!(matches!(
            store.record_failure(999, &validation("x"), Classification::Terminal),
            Err(Error::EntryNotFound(999))
        ));
    }

    #[test]
    fn test_remove_and_lookup_by_uri() {
        let store = DeadLetterStore::open_in_memory().unwrap();
        let f = frame(5, "k5");
        let id = store
            .dead_letter(&f, &validation("x"), Classification::Terminal, 0)
            .unwrap();

        let by_uri = store.entries_for_uri(f.entity_ref().uri()).unwrap();
        assert_eq!(by_uri.len(), 1);

        assert!(store.remove(id).unwrap());
        assert!(!store.remove(id).unwrap());
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.get(id).unwrap().is_none());
    }
}
