//! Partition-scoped sessions.
//!
//! Nothing enforces a single open session per partition, so callers ask for
//! the most recent open one instead of assuming uniqueness.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::now_timestamp;
use super::types::Session;
use crate::error::{Error, Result};

const COLUMNS: &str = "id, partition_key, started_at, ended_at, summary";

fn map_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        partition_key: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        summary: row.get(4)?,
    })
}

/// Open a new session in `partition`.
pub fn start(conn: &Connection, partition: &str) -> Result<Session> {
    if partition.trim().is_empty() {
        return Err(Error::InvalidInput("partition key must not be empty".into()));
    }
    let session = Session {
        id: uuid::Uuid::now_v7().to_string(),
        partition_key: partition.to_string(),
        started_at: now_timestamp(),
        ended_at: None,
        summary: None,
    };
    conn.execute(
        "INSERT INTO sessions (id, partition_key, started_at) VALUES (?1, ?2, ?3)",
        params![session.id, session.partition_key, session.started_at],
    )?;
    tracing::info!(id = %session.id, partition, "session started");
    Ok(session)
}

/// Close a session. `false` if it is unknown or already ended.
pub fn end(conn: &Connection, id: &str, summary: Option<&str>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sessions SET ended_at = ?1, summary = COALESCE(?2, summary) \
         WHERE id = ?3 AND ended_at IS NULL",
        params![now_timestamp(), summary, id],
    )?;
    if changed > 0 {
        tracing::info!(id, "session ended");
    }
    Ok(changed > 0)
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"),
            [id],
            map_row,
        )
        .optional()?;
    Ok(session)
}

/// Most recently started open session in `partition`.
pub fn current_open(conn: &Connection, partition: &str) -> Result<Option<Session>> {
    let session = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM sessions \
                 WHERE partition_key = ?1 AND ended_at IS NULL \
                 ORDER BY started_at DESC, rowid DESC LIMIT 1"
            ),
            [partition],
            map_row,
        )
        .optional()?;
    Ok(session)
}

/// Sessions in `partition`, newest first.
pub fn list(conn: &Connection, partition: &str, limit: usize) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM sessions WHERE partition_key = ?1 \
         ORDER BY started_at DESC, rowid DESC LIMIT ?2"
    ))?;
    let sessions = stmt
        .query_map(params![partition, limit as i64], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sessions)
}

/// Ended sessions with no threshold checkpoint yet, oldest first, across all
/// partitions.
pub fn ended_without_checkpoint(conn: &Connection, limit: usize) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM sessions s \
         WHERE s.ended_at IS NOT NULL \
           AND NOT EXISTS (SELECT 1 FROM threshold_history h WHERE h.session_id = s.id) \
         ORDER BY s.ended_at, s.rowid LIMIT ?1"
    ))?;
    let sessions = stmt
        .query_map([limit as i64], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sessions)
}
