//! Durable firehose cursor.
//!
//! The [`CursorManager`] owns the only copy of the cursor. It persists the
//! last sequence whose frame reached a terminal outcome and, through an
//! in-memory [`Watermark`], decides which sequence is safe to persist while
//! frames are still in flight on the worker lanes.
//!
//! ```text
//! track(101) track(102) track(103)   resolve(102)  resolve(101)
//!        safe = 100                   safe = 100    safe = 102
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use metrics::gauge;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::Result;
use crate::schema;

/// Checkpoint key for the relay firehose.
pub const FIREHOSE_CURSOR_KEY: &str = "firehose_seq";

/// Tracks in-flight sequences and computes the safe checkpoint.
///
/// Sequences must be tracked in increasing order. The safe point is one
/// below the oldest unresolved sequence, or the highest sequence seen when
/// nothing is in flight, and never moves backwards.
#[derive(Debug, Default)]
pub struct Watermark {
    in_flight: BTreeSet<u64>,
    highest_seen: Option<u64>,
    floor: Option<u64>,
}

impl Watermark {
    /// Start from a previously persisted cursor.
    pub fn starting_at(cursor: Option<u64>) -> Self {
        Self {
            in_flight: BTreeSet::new(),
            highest_seen: cursor,
            floor: cursor,
        }
    }

    /// A frame entered the pipeline and has not reached a terminal outcome.
    pub fn track(&mut self, seq: u64) {
        self.in_flight.insert(seq);
        self.observe(seq);
    }

    /// A frame reached a terminal outcome without entering the pipeline
    /// (filtered, invalid).
    pub fn observe(&mut self, seq: u64) {
        self.highest_seen = self.highest_seen.max(Some(seq));
    }

    /// A tracked frame reached a terminal outcome.
    pub fn resolve(&mut self, seq: u64) {
        self.in_flight.remove(&seq);
    }

    pub fn safe_point(&self) -> Option<u64> {
        let candidate = match self.in_flight.first() {
            Some(&oldest) => oldest.checked_sub(1),
            None => self.highest_seen,
        };
        candidate.max(self.floor)
    }

    pub fn highest_seen(&self) -> Option<u64> {
        self.highest_seen
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn advance_floor(&mut self, seq: u64) {
        self.floor = self.floor.max(Some(seq));
    }
}

/// Durable cursor plus the watermark that feeds it.
pub struct CursorManager {
    conn: Mutex<Connection>,
    key: String,
    watermark: Mutex<Watermark>,
    persisted: Mutex<Option<u64>>,
}

impl CursorManager {
    /// Open the cursor stored under `key` in the state database at `path`.
    pub fn open(path: &Path, key: &str) -> Result<Self> {
        Self::from_connection(schema::open_state_db(path)?, key)
    }

    /// Open an in-memory cursor (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(schema::open_state_db_in_memory()?, FIREHOSE_CURSOR_KEY)
    }

    fn from_connection(conn: Connection, key: &str) -> Result<Self> {
        let persisted = read_checkpoint(&conn, key)?;
        Ok(Self {
            conn: Mutex::new(conn),
            key: key.to_string(),
            watermark: Mutex::new(Watermark::starting_at(persisted)),
            persisted: Mutex::new(persisted),
        })
    }

    /// Last persisted sequence, `None` on a fresh database.
    pub fn load(&self) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        read_checkpoint(&conn, &self.key)
    }

    /// Persist `seq` synchronously. Lower values than the stored one are
    /// ignored, so the stored cursor is monotonic.
    pub fn checkpoint(&self, seq: u64) -> Result<()> {
        let now = schema::unix_now();
        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO ingestion_checkpoint (key, value, updated_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET
                    value = MAX(value, excluded.value),
                    updated_at = excluded.updated_at",
                rusqlite::params![self.key, seq as i64, now],
            )?;
        }

        let mut persisted = self.persisted.lock();
        *persisted = (*persisted).max(Some(seq));
        self.watermark.lock().advance_floor(seq);
        gauge!("cursor_sequence").set(seq as f64);
        Ok(())
    }

    pub fn track(&self, seq: u64) {
        self.watermark.lock().track(seq);
    }

    pub fn observe(&self, seq: u64) {
        self.watermark.lock().observe(seq);
    }

    pub fn resolve(&self, seq: u64) {
        self.watermark.lock().resolve(seq);
    }

    /// Highest sequence handed to this manager since startup (or the loaded
    /// cursor).
    pub fn highest_seen(&self) -> Option<u64> {
        self.watermark.lock().highest_seen()
    }

    /// Sequence that could be persisted right now.
    pub fn safe_point(&self) -> Option<u64> {
        self.watermark.lock().safe_point()
    }

    /// Persist the safe point if it moved past the stored cursor.
    ///
    /// Returns the sequence written, if any.
    pub fn flush(&self) -> Result<Option<u64>> {
        let (safe, highest) = {
            let watermark = self.watermark.lock();
            (watermark.safe_point(), watermark.highest_seen())
        };

        if let (Some(safe), Some(highest)) = (safe, highest) {
            gauge!("cursor_lag").set(highest.saturating_sub(safe) as f64);
        }

        let Some(safe) = safe else {
            return Ok(None);
        };
        if *self.persisted.lock() >= Some(safe) {
            return Ok(None);
        }

        self.checkpoint(safe)?;
        debug!("Checkpointed cursor at {}", safe);
        Ok(Some(safe))
    }

    /// All stored checkpoints, for introspection.
    pub fn checkpoints(&self) -> Result<Vec<(String, u64, i64)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT key, value, updated_at FROM ingestion_checkpoint ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn read_checkpoint(conn: &Connection, key: &str) -> Result<Option<u64>> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT value FROM ingestion_checkpoint WHERE key = ?",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.map(|v| v as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_watermark_waits_for_oldest() {
        let mut wm = Watermark::starting_at(Some(100));
        wm.track(101);
        wm.track(102);
        wm.track(103);
        assert_eq!(wm.safe_point(), Some(100));

        wm.resolve(102);
        assert_eq!(wm.safe_point(), Some(100));

        wm.resolve(101);
        assert_eq!(wm.safe_point(), Some(102));

        wm.resolve(103);
        assert_eq!(wm.safe_point(), Some(103));
    }

    #[test]
    fn test_watermark_observed_frames_advance_when_idle() {
        let mut wm = Watermark::default();
        assert_eq!(wm.safe_point(), None);

        wm.observe(7);
        assert_eq!(wm.safe_point(), Some(7));

        wm.track(8);
        wm.observe(9);
        assert_eq!(wm.safe_point(), Some(7));

        wm.resolve(8);
        assert_eq!(wm.safe_point(), Some(9));
    }

    #[test]
    fn test_watermark_never_below_floor() {
        let mut wm = Watermark::starting_at(Some(50));
        // A replayed frame below the persisted cursor must not drag it back.
        wm.track(40);
        assert_eq!(wm.safe_point(), Some(50));
    }

    #[test]
    fn test_checkpoint_fresh_db() {
        let cursor = CursorManager::open_in_memory().unwrap();
        assert_eq!(cursor.load().unwrap(), None);
        assert_eq!(cursor.flush().unwrap(), None);
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let cursor = CursorManager::open_in_memory().unwrap();
        cursor.checkpoint(200).unwrap();
        cursor.checkpoint(150).unwrap();
        assert_eq!(cursor.load().unwrap(), Some(200));

        let checkpoints = cursor.checkpoints().unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].0, FIREHOSE_CURSOR_KEY);
        assert_eq!(checkpoints[0].1, 200);
    }

    #[test]
    fn test_flush_writes_only_safe_point() {
        let cursor = CursorManager::open_in_memory().unwrap();
        cursor.track(10);
        cursor.track(11);
        cursor.resolve(11);

        assert_eq!(cursor.flush().unwrap(), Some(9));
        assert_eq!(cursor.load().unwrap(), Some(9));

        // Nothing new to write.
        assert_eq!(cursor.flush().unwrap(), None);

        cursor.resolve(10);
        assert_eq!(cursor.flush().unwrap(), Some(11));
        assert_eq!(cursor.load().unwrap(), Some(11));
    }

    #[test]
    fn test_cursor_survives_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");

        {
            let cursor = CursorManager::open(&path, FIREHOSE_CURSOR_KEY).unwrap();
            cursor.track(1000);
            cursor.track(1001);
            cursor.resolve(1001);
            cursor.flush().unwrap();
        }

        let cursor = CursorManager::open(&path, FIREHOSE_CURSOR_KEY).unwrap();
        assert_eq!(cursor.load().unwrap(), Some(999));
        assert_eq!(cursor.safe_point(), Some(999));
        assert_eq!(cursor.highest_seen(), Some(999));
    }

    #[test]
    fn test_keys_are_independent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let a = CursorManager::open(&path, "a").unwrap();
        let b = CursorManager::open(&path, "b").unwrap();
        a.checkpoint(5).unwrap();
        assert_eq!(b.load().unwrap(), None);
        assert_eq!(a.load().unwrap(), Some(5));
    }
}
