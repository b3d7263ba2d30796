//! SQLite-backed node registry and metric sample log.
//!
//! One connection guarded by a mutex; ingestion appends and scheduler reads
//! serialize on it. Samples are immutable once written.

pub mod schema;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use time::OffsetDateTime;

use crate::config::NodeConf;
use crate::error::{ControlError, Result};
use crate::models::{MetricSample, Node};

/// One score produced by a scoring pass
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreUpdate {
    pub node_id: String,
    pub ai_score: f64,
}

/// Storage operations needed by a scoring pass.
///
/// Implemented by [`NodeStore`]; tests substitute slow or failing stores.
pub trait ScoreStore: Send + Sync {
    fn active_nodes(&self) -> Result<Vec<Node>>;
    /// Samples recorded at or after `since`, newest first
    fn recent_samples(&self, node_id: &str, since: OffsetDateTime) -> Result<Vec<MetricSample>>;
    /// Writes every update in one transaction; returns rows changed
    fn commit_scores(&self, updates: &[ScoreUpdate], at: OffsetDateTime) -> Result<usize>;
}

pub struct NodeStore {
    conn: Mutex<Connection>,
}

const NODE_COLUMNS: &str = "id, name, address, port, protocol, active, load_factor, ai_score, \
                            secret, last_heartbeat_at, score_updated_at";

impl NodeStore {
    /// Opens or creates the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        schema::init_schema(&conn)?;

        tracing::info!(path = %path.display(), "opened node store");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Inserts or refreshes node metadata from configuration.
    ///
    /// `ai_score` is never touched. `load_factor` is only taken from the
    /// configuration on first insert; later changes come from the admin route.
    pub fn upsert_node(&self, id: &str, conf: &NodeConf) -> Result<()> {
        if !(0.0..=1.0).contains(&conf.load_factor) {
            return Err(ControlError::Validation(format!(
                "node {id}: load_factor {} outside [0, 1]",
                conf.load_factor
            )));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nodes (id, name, address, port, protocol, active, load_factor, secret)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                address = excluded.address,
                port = excluded.port,
                protocol = excluded.protocol,
                active = excluded.active,
                secret = excluded.secret",
            params![
                id,
                conf.name,
                conf.address,
                conf.port as i64,
                conf.protocol,
                conf.active,
                conf.load_factor,
                conf.secret,
            ],
        )?;
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let conn = self.conn.lock();
        let node = conn
            .query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1"),
                [id],
                node_from_row,
            )
            .optional()?;
        Ok(node)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    pub fn set_load_factor(&self, id: &str, load_factor: f64) -> Result<()> {
        if !load_factor.is_finite() || !(0.0..=1.0).contains(&load_factor) {
            return Err(ControlError::Validation(format!(
                "load_factor {load_factor} outside [0, 1]"
            )));
        }
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE nodes SET load_factor = ?1 WHERE id = ?2",
            params![load_factor, id],
        )?;
        if changed == 0 {
            return Err(ControlError::NodeNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Appends the sample (if any) and stamps `last_heartbeat_at` atomically.
    pub fn record_heartbeat(
        &self,
        node_id: &str,
        sample: Option<&MetricSample>,
        received_at: OffsetDateTime,
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut stored = 0;
        if let Some(s) = sample {
            stored = tx.execute(
                "INSERT INTO metric_samples
                 (node_id, latency_ms, packet_loss, cpu_percent, memory_percent, recorded_at, reported_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    s.node_id,
                    s.latency_ms,
                    s.packet_loss,
                    s.cpu_percent,
                    s.memory_percent,
                    to_millis(s.recorded_at),
                    s.reported_at.map(to_millis),
                ],
            )?;
        }

        let touched = tx.execute(
            "UPDATE nodes SET last_heartbeat_at = ?1 WHERE id = ?2",
            params![to_millis(received_at), node_id],
        )?;
        if touched == 0 {
            // dropping tx rolls back the sample insert
            return Err(ControlError::NodeNotFound(node_id.to_string()));
        }

        tx.commit()?;
        Ok(stored)
    }

    /// Mean latency per node over samples recorded at or after `since`.
    /// Nodes without any measured latency are absent from the map.
    pub fn mean_latency_since(&self, since: OffsetDateTime) -> Result<HashMap<String, f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, AVG(latency_ms) FROM metric_samples
             WHERE recorded_at >= ?1 AND latency_ms IS NOT NULL
             GROUP BY node_id",
        )?;
        let rows = stmt
            .query_map([to_millis(since)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(rows)
    }

    /// Deletes samples recorded before `cutoff`.
    pub fn purge_samples_before(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM metric_samples WHERE recorded_at < ?1",
            [to_millis(cutoff)],
        )?;
        Ok(deleted)
    }

    pub fn sample_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM metric_samples", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

impl ScoreStore for NodeStore {
    fn active_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE active = 1 ORDER BY id"
        ))?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    fn recent_samples(&self, node_id: &str, since: OffsetDateTime) -> Result<Vec<MetricSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, latency_ms, packet_loss, cpu_percent, memory_percent, recorded_at, reported_at
             FROM metric_samples
             WHERE node_id = ?1 AND recorded_at >= ?2
             ORDER BY recorded_at DESC, id DESC",
        )?;
        let samples = stmt
            .query_map(params![node_id, to_millis(since)], sample_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(samples)
    }

    fn commit_scores(&self, updates: &[ScoreUpdate], at: OffsetDateTime) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE nodes SET ai_score = ?1, score_updated_at = ?2 WHERE id = ?3",
            )?;
            for update in updates {
                changed += stmt.execute(params![update.ai_score, to_millis(at), update.node_id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }
}

fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_from_millis(idx: usize, ms: Option<i64>) -> rusqlite::Result<Option<OffsetDateTime>> {
    ms.map(|v| from_millis(idx, v)).transpose()
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let port: i64 = row.get(3)?;
    Ok(Node {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        port: u16::try_from(port).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, port))?,
        protocol: row.get(4)?,
        active: row.get(5)?,
        load_factor: row.get(6)?,
        ai_score: row.get(7)?,
        secret: row.get(8)?,
        last_heartbeat_at: opt_from_millis(9, row.get(9)?)?,
        score_updated_at: opt_from_millis(10, row.get(10)?)?,
    })
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<MetricSample> {
    Ok(MetricSample {
        node_id: row.get(0)?,
        latency_ms: row.get(1)?,
        packet_loss: row.get(2)?,
        cpu_percent: row.get(3)?,
        memory_percent: row.get(4)?,
        recorded_at: from_millis(5, row.get(5)?)?,
        reported_at: opt_from_millis(6, row.get(6)?)?,
    })
}
