//! SQLite schema for node metadata and metric samples.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Creates all tables on a fresh database.
///
/// Refuses to open a file written by a newer schema than this binary understands.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(rusqlite::Error::InvalidParameterName(format!(
            "database schema v{current_version} is newer than supported v{SCHEMA_VERSION}"
        )));
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
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
        -- Relay nodes; ai_score is written only by the scoring scheduler
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT NOT NULL,
            port INTEGER NOT NULL,
            protocol TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            load_factor REAL NOT NULL DEFAULT 0
                CHECK (load_factor >= 0 AND load_factor <= 1),
            ai_score REAL NOT NULL DEFAULT 0
                CHECK (ai_score >= 0 AND ai_score <= 100),
            secret TEXT,
            last_heartbeat_at INTEGER,
            score_updated_at INTEGER
        );

        -- Append-only samples, timestamps in unix milliseconds
        CREATE TABLE IF NOT EXISTS metric_samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
            latency_ms REAL CHECK (latency_ms IS NULL OR latency_ms >= 0),
            packet_loss REAL
                CHECK (packet_loss IS NULL OR (packet_loss >= 0 AND packet_loss <= 1)),
            cpu_percent REAL,
            memory_percent REAL,
            recorded_at INTEGER NOT NULL,
            reported_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_nodes_active ON nodes(active);
        CREATE INDEX IF NOT EXISTS idx_samples_node_time ON metric_samples(node_id, recorded_at);
        CREATE INDEX IF NOT EXISTS idx_samples_time ON metric_samples(recorded_at);
        "#,
    )
}
