//! SQLite relational index.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use lattice_core::{EntityReference, RecordKind};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use super::{RelationalRow, RelationalStore};
use crate::error::{StoreError, StoreErrorKind, StoreResult};
use crate::{Error, Result};

/// SQLite-backed [`RelationalStore`].
pub struct SqliteRelationalStore {
    conn: Mutex<Connection>,
}

impl SqliteRelationalStore {
    /// Open or create the index database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening relational index at {}", path.display());

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open SQLite: {}", e)))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Database(format!("Failed to set PRAGMA: {}", e)))?;
        init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory index (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of indexed records.
    pub fn count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// URIs of records pointing at `subject_uri` (reviews, endorsements, tags).
    pub fn dependents_of(&self, subject_uri: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT uri FROM records WHERE subject_uri = ? ORDER BY seq")?;
        let uris = stmt
            .query_map([subject_uri], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(uris)
    }
}

fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            uri TEXT NOT NULL UNIQUE,
            did TEXT NOT NULL,
            collection TEXT NOT NULL,
            rkey TEXT NOT NULL,
            kind TEXT NOT NULL,
            cid TEXT NOT NULL,
            seq INTEGER NOT NULL,
            title TEXT,
            subject_uri TEXT,
            record TEXT NOT NULL,
            created_at TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_records_did ON records(did);
        CREATE INDEX IF NOT EXISTS idx_records_subject ON records(subject_uri);
        "#,
    )
}

impl RelationalStore for SqliteRelationalStore {
    fn upsert(&self, row: &RelationalRow) -> StoreResult<()> {
        let record = serde_json::to_string(&row.record)?;
        let conn = self.conn.lock();
        // Never replace a newer version.
        conn.execute(
            "INSERT INTO records
                (id, uri, did, collection, rkey, kind, cid, seq, title, subject_uri,
                 record, created_at, indexed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, unixepoch())
             ON CONFLICT(id) DO UPDATE SET
                cid = excluded.cid,
                seq = excluded.seq,
                title = excluded.title,
                subject_uri = excluded.subject_uri,
                record = excluded.record,
                created_at = excluded.created_at,
                indexed_at = excluded.indexed_at
             WHERE excluded.seq >= records.seq",
            rusqlite::params![
                row.entity.id(),
                row.entity.uri(),
                row.did,
                row.collection,
                row.rkey,
                row.kind.as_str(),
                row.cid,
                row.seq as i64,
                row.title,
                row.subject_uri,
                record,
                row.created_at,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, entity: &EntityReference) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute("DELETE FROM records WHERE id = ?", [entity.id()])?;
        Ok(changed > 0)
    }

    fn get(&self, entity: &EntityReference) -> StoreResult<Option<RelationalRow>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT did, collection, rkey, kind, cid, seq, title, subject_uri, record, created_at
                 FROM records WHERE id = ?",
                [entity.id()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?
        };

        let Some((did, collection, rkey, kind, cid, seq, title, subject_uri, record, created_at)) =
            raw
        else {
            return Ok(None);
        };

        let kind = RecordKind::from_str(&kind).map_err(|_| {
            StoreError::new(
                "sqlite",
                StoreErrorKind::Schema,
                format!("unknown record kind '{kind}' for {}", entity.uri()),
            )
        })?;

        Ok(Some(RelationalRow {
            entity: entity.clone(),
            did,
            collection,
            rkey,
            kind,
            cid,
            seq: seq as u64,
            title,
            subject_uri,
            record: serde_json::from_str(&record)?,
            created_at,
        }))
    }

    fn indexed_seq(&self, entity: &EntityReference) -> StoreResult<Option<u64>> {
        let conn = self.conn.lock();
        let seq: Option<i64> = conn
            .query_row("SELECT seq FROM records WHERE id = ?", [entity.id()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(seq.map(|s| s as u64))
    }

    fn title(&self, entity: &EntityReference) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        let title: Option<Option<String>> = conn
            .query_row("SELECT title FROM records WHERE id = ?", [entity.id()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(title.flatten())
    }
}
