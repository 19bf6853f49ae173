//! SQLite schema for the ingester's own state database.
//!
//! Holds the ingestion checkpoint and the dead-letter store. The relational
//! index lives in a separate database (see [`crate::store::relational`]).

use rusqlite::{Connection, Result};
use std::path::Path;
use std::time::Duration;

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Open the state database at `path`, creating parent directories, enabling
/// WAL and initializing the schema. Several handles may share one file.
pub fn open_state_db(path: &Path) -> crate::Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)
        .map_err(|e| crate::Error::Database(format!("Failed to open SQLite: {}", e)))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .map_err(|e| crate::Error::Database(format!("Failed to set PRAGMA: {}", e)))?;
    init_schema(&conn)
        .map_err(|e| crate::Error::Database(format!("Failed to init schema: {}", e)))?;
    Ok(conn)
}

/// Open an in-memory state database (for testing).
pub fn open_state_db_in_memory() -> crate::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Create all tables on a fresh database.
pub fn init_schema(conn: &Connection) -> Result<()> {
    if get_schema_version(conn)? == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }
    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Last fully processed firehose sequence, per stream
        CREATE TABLE IF NOT EXISTS ingestion_checkpoint (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Frames that could not be indexed
        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            seq INTEGER NOT NULL,
            uri TEXT NOT NULL,
            operation TEXT NOT NULL,
            frame TEXT NOT NULL,
            reason TEXT NOT NULL,
            error_label TEXT NOT NULL,
            classification TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            first_failed_at INTEGER NOT NULL,
            last_failed_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_dead_letters_first_failed ON dead_letters(first_failed_at, id);
        CREATE INDEX IF NOT EXISTS idx_dead_letters_uri ON dead_letters(uri);
        "#,
    )
}

/// Current time as unix seconds, for `*_at` columns.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_init_schema_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables = tables(&conn);
        assert!(tables.contains(&"ingestion_checkpoint".to_string()));
        assert!(tables.contains(&"dead_letters".to_string()));
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_unix_now_is_seconds() {
        let now = unix_now();
        // After 2020-01-01 and well short of a millisecond timestamp.
        assert!(now > 1_577_836_800);
        assert!(now < 100_000_000_000);
    }
}
