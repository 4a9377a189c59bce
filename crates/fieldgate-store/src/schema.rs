//! Database schema and version tracking.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// A database stamped with any other version is refused rather than opened
/// with a layout this build does not know.
pub fn initialize(conn: &Connection) -> Result<()> {
    match get_schema_version(conn)? {
        0 => {
            // Fresh database - create all tables
            create_schema_v1(conn)?;
            set_schema_version(conn, SCHEMA_VERSION)?;
        }
        SCHEMA_VERSION => {}
        found => {
            return Err(Error::UnsupportedSchema {
                found,
                supported: SCHEMA_VERSION,
            });
        }
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the initial schema (version 1).
///
/// All timestamps are unix seconds (UTC).
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- Device registry
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            address INTEGER UNIQUE,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            model TEXT,
            location TEXT,
            description TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            online INTEGER NOT NULL DEFAULT 0,
            last_seen INTEGER,
            error_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_devices_kind ON devices(kind, enabled);

        -- Aggregated and pushed records awaiting or past delivery
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id),
            payload TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            uploaded INTEGER NOT NULL DEFAULT 0 CHECK (uploaded IN (0, 1)),
            uploaded_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_records_pending
            ON records(uploaded, timestamp);
        CREATE INDEX IF NOT EXISTS idx_records_device_time
            ON records(device_id, timestamp);

        -- Delivery attempts
        CREATE TABLE IF NOT EXISTS upload_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT NOT NULL,
            data_type TEXT NOT NULL,
            record_count INTEGER NOT NULL,
            status TEXT NOT NULL,
            http_status INTEGER,
            error_message TEXT,
            created_at INTEGER NOT NULL
        );

        -- Audit events
        CREATE TABLE IF NOT EXISTS system_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            level TEXT NOT NULL,
            module TEXT NOT NULL,
            message TEXT NOT NULL,
            device_id TEXT,
            extra TEXT,
            created_at INTEGER NOT NULL
        );

        -- Per-device failures
        CREATE TABLE IF NOT EXISTS device_error_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            error_type TEXT NOT NULL,
            error_message TEXT NOT NULL,
            error_code INTEGER,
            extra TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_device_errors_device
            ON device_error_logs(device_id, created_at);
        "#,
    )?;

    Ok(())
}
