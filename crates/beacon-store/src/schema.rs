use rusqlite::Connection;

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    // FULL fsyncs the WAL on every commit: an acknowledged enqueue survives power loss.
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Errors are non-fatal: in-memory DBs and fresh files legitimately fail this.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::debug!("startup WAL checkpoint complete");
    }

    if let Some(found) = get_schema_version(conn)?
        && found > SCHEMA_VERSION
    {
        return Err(StoreError::InvalidData(format!(
            "database schema v{found} is newer than supported v{SCHEMA_VERSION}"
        )));
    }

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS readings_queue (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            origin_id       TEXT NOT NULL UNIQUE,
            latitude        REAL NOT NULL,
            longitude       REAL NOT NULL,
            accuracy        REAL NOT NULL,
            altitude        REAL,
            speed           REAL,
            heading         REAL,
            battery_level   REAL,
            signal_strength INTEGER,
            reading_time    INTEGER NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'synced', 'abandoned')),
            retry_count     INTEGER NOT NULL DEFAULT 0,
            last_error      TEXT,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS events_queue (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            origin_id   TEXT NOT NULL UNIQUE,
            event_type  TEXT NOT NULL,
            payload     TEXT NOT NULL,
            event_time  INTEGER NOT NULL,
            status      TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'synced', 'abandoned')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error  TEXT,
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_runs (
            id              TEXT PRIMARY KEY,
            trigger_kind    TEXT NOT NULL,
            item_count      INTEGER NOT NULL,
            success_count   INTEGER NOT NULL,
            failure_count   INTEGER NOT NULL,
            abandoned_count INTEGER NOT NULL DEFAULT 0,
            start_time      INTEGER NOT NULL,
            end_time        INTEGER NOT NULL,
            error_message   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_readings_status ON readings_queue(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_events_status ON events_queue(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_runs_start ON sync_runs(start_time);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let has_metadata: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'metadata')",
        [],
        |row| row.get(0),
    )?;
    if !has_metadata {
        return Ok(None);
    }
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
