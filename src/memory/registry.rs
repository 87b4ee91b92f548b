//! Tool registry: a second partitioned corpus with usage tracking.
//!
//! Rows are keyed by `(name, partition_key)` with a NULL partition meaning
//! global; a global row and a partition-local row with the same name are
//! distinct. Every write is a single statement or one IMMEDIATE transaction,
//! so concurrent writers from other processes never lose an increment.

use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;

use super::types::{RegistryDefaults, RegistryEntry, ToolScope, ToolStatus};
use super::{now_timestamp, timestamp_days_ago, MAX_EMBED_ATTEMPTS};
use crate::db::Store;
use crate::embedding::{embedding_to_bytes, EmbeddingProvider, EMBEDDING_DIM};
use crate::error::{Error, Result};
use crate::search::vector::VectorIndex;
use crate::search::{self, MatchType, SearchOptions, TOOLS};

const COLUMNS: &str = "id, name, partition_key, scope, status, usage_count, last_used_at, \
                       description, created_at, updated_at, status_changed_at";

/// Insert-or-update input for [`upsert`].
#[derive(Debug, Clone)]
pub struct RegistryUpsert {
    pub name: String,
    /// `None` for a global entry.
    pub partition_key: Option<String>,
    pub scope: ToolScope,
    pub description: Option<String>,
}

/// Result of a staleness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub staled: usize,
    pub demoted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryHit {
    pub entry: RegistryEntry,
    pub score: f64,
    pub match_type: MatchType,
    pub snippet: Option<String>,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<RegistryEntry> {
    Ok(RegistryEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        partition_key: row.get(2)?,
        scope: row.get(3)?,
        status: row.get(4)?,
        usage_count: row.get(5)?,
        last_used_at: row.get(6)?,
        description: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        status_changed_at: row.get(10)?,
    })
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidInput("tool name must not be empty".into()));
    }
    Ok(())
}

/// Insert an entry, or update scope and description of the existing one.
///
/// A `None` description leaves the stored description alone.
pub fn upsert(conn: &Connection, entry: &RegistryUpsert) -> Result<RegistryEntry> {
    check_name(&entry.name)?;
    let now = now_timestamp();
    let row = conn.query_row(
        &format!(
            "INSERT INTO tools (id, name, partition_key, scope, description, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(name, COALESCE(partition_key, '')) DO UPDATE SET \
                 scope = excluded.scope, \
                 description = COALESCE(excluded.description, tools.description), \
                 updated_at = excluded.updated_at \
             RETURNING {COLUMNS}"
        ),
        params![
            uuid::Uuid::now_v7().to_string(),
            entry.name,
            entry.partition_key,
            entry.scope,
            entry.description,
            now,
        ],
        map_row,
    )?;
    Ok(row)
}

/// Count one use of `name`, creating the entry if it does not exist.
///
/// One `INSERT .. ON CONFLICT DO UPDATE` statement, so concurrent callers
/// can neither duplicate the row nor lose an increment. Use also reactivates
/// a stale or demoted entry. Returns the new usage count.
pub fn record_usage_or_create(
    conn: &Connection,
    name: &str,
    partition: Option<&str>,
    defaults: &RegistryDefaults,
) -> Result<i64> {
    check_name(name)?;
    let now = now_timestamp();
    let count = conn.query_row(
        "INSERT INTO tools \
             (id, name, partition_key, scope, status, usage_count, description, \
              last_used_at, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 'active', 1, ?5, ?6, ?6, ?6) \
         ON CONFLICT(name, COALESCE(partition_key, '')) DO UPDATE SET \
             usage_count = tools.usage_count + 1, \
             last_used_at = excluded.last_used_at, \
             status_changed_at = CASE WHEN tools.status != 'active' \
                 THEN excluded.last_used_at ELSE tools.status_changed_at END, \
             status = 'active', \
             updated_at = excluded.updated_at \
         RETURNING usage_count",
        params![
            uuid::Uuid::now_v7().to_string(),
            name,
            partition,
            defaults.scope,
            defaults.description,
            now,
        ],
        |row| row.get::<_, i64>(0),
    )?;
    tracing::debug!(name, partition = ?partition, count, "tool usage recorded");
    Ok(count)
}

/// Exact `(name, partition)` lookup; `None` partition addresses the global row.
pub fn get(conn: &Connection, name: &str, partition: Option<&str>) -> Result<Option<RegistryEntry>> {
    let entry = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM tools \
                 WHERE name = ?1 AND COALESCE(partition_key, '') = COALESCE(?2, '')"
            ),
            params![name, partition],
            map_row,
        )
        .optional()?;
    Ok(entry)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<RegistryEntry>> {
    let entry = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM tools WHERE id = ?1"),
            [id],
            map_row,
        )
        .optional()?;
    Ok(entry)
}

/// Entries visible to `partition` (its own plus global), or only global rows
/// when `partition` is `None`. Most used first.
pub fn list(
    conn: &Connection,
    partition: Option<&str>,
    status: Option<ToolStatus>,
) -> Result<Vec<RegistryEntry>> {
    let mut sql = format!("SELECT {COLUMNS} FROM tools WHERE ");
    let mut bound: Vec<(&str, &dyn ToSql)> = Vec::new();
    match &partition {
        Some(p) => {
            sql.push_str("(partition_key = :partition OR partition_key IS NULL)");
            bound.push((":partition", p));
        }
        None => sql.push_str("partition_key IS NULL"),
    }
    if let Some(status) = &status {
        sql.push_str(" AND status = :status");
        bound.push((":status", status));
    }
    sql.push_str(" ORDER BY usage_count DESC, name, rowid");

    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(bound.as_slice(), map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Move an entry to `status`. No-op (returns `false`) when it already has it.
fn set_status(conn: &Connection, id: &str, status: ToolStatus) -> Result<bool> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE tools SET status = ?1, status_changed_at = ?2, updated_at = ?2 \
         WHERE id = ?3 AND status != ?1",
        params![status, now, id],
    )?;
    if changed > 0 {
        tracing::debug!(id, status = %status, "tool status changed");
    }
    Ok(changed > 0)
}

pub fn mark_stale(conn: &Connection, id: &str) -> Result<bool> {
    set_status(conn, id, ToolStatus::Stale)
}

pub fn mark_demoted(conn: &Connection, id: &str) -> Result<bool> {
    set_status(conn, id, ToolStatus::Demoted)
}

pub fn mark_active(conn: &Connection, id: &str) -> Result<bool> {
    set_status(conn, id, ToolStatus::Active)
}

/// Demote entries unused for `demote_after_days`, then mark active entries
/// unused for `stale_after_days` as stale. Never-used entries age from creation.
pub fn sweep_stale(conn: &Connection, stale_after_days: u64, demote_after_days: u64) -> Result<SweepReport> {
    let now = now_timestamp();
    let demote_cutoff = timestamp_days_ago(demote_after_days);
    let stale_cutoff = timestamp_days_ago(stale_after_days);

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let demoted = tx.execute(
        "UPDATE tools SET status = 'demoted', status_changed_at = ?1, updated_at = ?1 \
         WHERE status != 'demoted' AND COALESCE(last_used_at, created_at) < ?2",
        params![now, demote_cutoff],
    )?;
    let staled = tx.execute(
        "UPDATE tools SET status = 'stale', status_changed_at = ?1, updated_at = ?1 \
         WHERE status = 'active' AND COALESCE(last_used_at, created_at) < ?2",
        params![now, stale_cutoff],
    )?;
    tx.commit()?;

    if staled + demoted > 0 {
        tracing::info!(staled, demoted, "registry sweep");
    }
    Ok(SweepReport { staled, demoted })
}

/// Store a vector for an entry and index it when the store can.
pub fn update_embedding(store: &Store, id: &str, vector: &[f32]) -> Result<bool> {
    if vector.len() != EMBEDDING_DIM {
        return Err(Error::InvalidInput(format!(
            "embedding has {} dimensions, expected {EMBEDDING_DIM}",
            vector.len()
        )));
    }

    let tx = Transaction::new_unchecked(store.conn(), TransactionBehavior::Immediate)?;
    let changed = tx.execute(
        "UPDATE tools SET embedding = ?1 WHERE id = ?2",
        params![embedding_to_bytes(vector), id],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    VectorIndex::new(&tx, &TOOLS, store.has_vector()).upsert(id, vector);
    tx.commit()?;
    Ok(true)
}

/// Non-demoted entries without a vector and with attempts left; never-failed
/// entries first, then oldest first.
pub fn find_unvectorized(conn: &Connection, limit: usize) -> Result<Vec<RegistryEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM tools \
         WHERE embedding IS NULL AND status != 'demoted' AND embed_attempts < ?1 \
         ORDER BY embed_attempts, created_at, rowid LIMIT ?2"
    ))?;
    let entries = stmt
        .query_map(params![MAX_EMBED_ATTEMPTS, limit as i64], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Count a failed embedding attempt against an entry. `None` if it is gone.
pub fn record_embed_failure(conn: &Connection, id: &str) -> Result<Option<u32>> {
    let attempts = conn
        .query_row(
            "UPDATE tools SET embed_attempts = embed_attempts + 1, embed_failed_at = ?1 \
             WHERE id = ?2 RETURNING embed_attempts",
            params![now_timestamp(), id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(attempts)
}

/// Text the worker embeds for an entry.
pub fn embedding_text(entry: &RegistryEntry) -> String {
    match &entry.description {
        Some(description) => format!("{}: {description}", entry.name),
        None => entry.name.clone(),
    }
}

/// Hybrid search over entries visible to `partition`; demoted entries are excluded.
pub fn search(
    store: &Store,
    query: &str,
    partition: &str,
    options: &SearchOptions,
    embedder: Option<&dyn EmbeddingProvider>,
) -> Result<Vec<RegistryHit>> {
    let hits = search::hybrid_search(store, &TOOLS, query, partition, options, embedder)?;
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<String> = (1..=hits.len()).map(|i| format!("?{i}")).collect();
    let mut stmt = store.conn().prepare(&format!(
        "SELECT {COLUMNS} FROM tools WHERE id IN ({})",
        placeholders.join(", ")
    ))?;
    let ids: Vec<&dyn ToSql> = hits.iter().map(|h| &h.id as &dyn ToSql).collect();
    let mut rows: HashMap<String, RegistryEntry> = stmt
        .query_map(ids.as_slice(), map_row)?
        .map(|r| r.map(|e| (e.id.clone(), e)))
        .collect::<Result<_, _>>()?;

    Ok(hits
        .into_iter()
        .filter_map(|hit| {
            rows.remove(&hit.id).map(|entry| RegistryHit {
                entry,
                score: hit.score,
                match_type: hit.match_type,
                snippet: hit.snippet,
            })
        })
        .collect())
}
