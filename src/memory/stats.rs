use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use super::MAX_EMBED_ATTEMPTS;
use crate::error::Result;

/// Store statistics for `cairn stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_observations: u64,
    pub live_observations: u64,
    pub deleted_observations: u64,
    /// Live rows by classification; `"unclassified"` for NULL.
    pub by_classification: BTreeMap<String, u64>,
    /// Live rows still waiting for a vector.
    pub unvectorized: u64,
    /// Live rows the embedder gave up on after repeated failures.
    pub embed_failed: u64,
    pub sessions: u64,
    pub open_sessions: u64,
    pub tools_by_status: BTreeMap<String, u64>,
    pub threshold_checkpoints: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_observation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_observation: Option<String>,
}

/// Compute store statistics.
///
/// If `partition` is provided, counts are restricted to it (tools include
/// global entries). `db_path` is used for file size; pass None for in-memory
/// databases.
pub fn store_stats(
    conn: &Connection,
    partition: Option<&str>,
    db_path: Option<&Path>,
) -> Result<StatsResponse> {
    let (where_clause, param) = partition_filter(partition, "partition_key = ?1");

    let (total, deleted, oldest, newest): (i64, i64, Option<String>, Option<String>) = conn
        .query_row(
            &format!(
                "SELECT COUNT(*), COUNT(deleted_at), MIN(created_at), MAX(created_at) \
                 FROM observations {where_clause}"
            ),
            params_from_iter(param.iter()),
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    let by_classification = grouped_counts(
        conn,
        &format!(
            "SELECT COALESCE(classification, 'unclassified'), COUNT(*) FROM observations \
             {} deleted_at IS NULL GROUP BY 1",
            and_or_where(&where_clause)
        ),
        &param,
        &["transient", "working", "durable", "noise", "unclassified"],
    )?;

    let unvectorized = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM observations {} embedding IS NULL AND deleted_at IS NULL \
             AND embed_attempts < {MAX_EMBED_ATTEMPTS}",
            and_or_where(&where_clause)
        ),
        &param,
    )?;
    let embed_failed = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM observations {} embedding IS NULL AND deleted_at IS NULL \
             AND embed_attempts >= {MAX_EMBED_ATTEMPTS}",
            and_or_where(&where_clause)
        ),
        &param,
    )?;

    let sessions = count(conn, &format!("SELECT COUNT(*) FROM sessions {where_clause}"), &param)?;
    let open_sessions = count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM sessions {} ended_at IS NULL",
            and_or_where(&where_clause)
        ),
        &param,
    )?;
    let threshold_checkpoints = count(
        conn,
        &format!("SELECT COUNT(*) FROM threshold_history {where_clause}"),
        &param,
    )?;

    let (tool_where, _) = partition_filter(partition, "(partition_key = ?1 OR partition_key IS NULL)");
    let tools_by_status = grouped_counts(
        conn,
        &format!("SELECT status, COUNT(*) FROM tools {tool_where} GROUP BY status"),
        &param,
        &["active", "stale", "demoted"],
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_observations: total as u64,
        live_observations: (total - deleted) as u64,
        deleted_observations: deleted as u64,
        by_classification,
        unvectorized,
        embed_failed,
        sessions,
        open_sessions,
        tools_by_status,
        threshold_checkpoints,
        db_size_bytes,
        oldest_observation: oldest,
        newest_observation: newest,
    })
}

fn count(conn: &Connection, sql: &str, param: &Option<String>) -> Result<u64> {
    let n: i64 = conn.query_row(sql, params_from_iter(param.iter()), |row| row.get(0))?;
    Ok(n as u64)
}

/// `GROUP BY` counts, with every expected key present (zero if absent).
fn grouped_counts(
    conn: &Connection,
    sql: &str,
    param: &Option<String>,
    keys: &[&str],
) -> Result<BTreeMap<String, u64>> {
    let mut map: BTreeMap<String, u64> = keys.iter().map(|k| (k.to_string(), 0)).collect();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(param.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (key, n) in rows {
        map.insert(key, n as u64);
    }
    Ok(map)
}

/// Build a WHERE clause for optional partition filtering.
fn partition_filter(partition: Option<&str>, predicate: &str) -> (String, Option<String>) {
    match partition {
        Some(p) => (format!("WHERE {predicate}"), Some(p.to_string())),
        None => (String::new(), None),
    }
}

/// Continue an optional WHERE clause with another condition.
fn and_or_where(where_clause: &str) -> String {
    if where_clause.is_empty() {
        "WHERE".to_string()
    } else {
        format!("{where_clause} AND")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{OpenOptions, Store};
    use crate::memory::types::{Classification, NewObservation, RegistryDefaults};
    use crate::memory::{observations, registry, sessions};

    fn test_store() -> Store {
        Store::open_in_memory(&OpenOptions::default().vector_extension(false)).unwrap()
    }

    #[test]
    fn test_empty_db_stats() {
        let store = test_store();
        let stats = store_stats(store.conn(), None, None).unwrap();
        assert_eq!(stats.total_observations, 0);
        assert_eq!(stats.by_classification["noise"], 0);
        assert_eq!(stats.tools_by_status["active"], 0);
        assert!(stats.oldest_observation.is_none());
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_stats_counts_and_partition_filter() {
        let store = test_store();
        let conn = store.conn();
        let a = observations::create(conn, &NewObservation::new("p1", "one")).unwrap();
        observations::create(
            conn,
            &NewObservation::new("p1", "two").classification(Classification::Durable),
        )
        .unwrap();
        observations::create(conn, &NewObservation::new("p2", "three")).unwrap();
        observations::soft_delete(conn, &a.id).unwrap();
        sessions::start(conn, "p1").unwrap();
        registry::record_usage_or_create(conn, "grep", None, &RegistryDefaults::default()).unwrap();
        registry::record_usage_or_create(conn, "make", Some("p2"), &RegistryDefaults::default())
            .unwrap();

        let all = store_stats(conn, None, None).unwrap();
        assert_eq!(all.total_observations, 3);
        assert_eq!(all.live_observations, 2);
        assert_eq!(all.deleted_observations, 1);
        assert_eq!(all.unvectorized, 2);
        assert_eq!(all.embed_failed, 0);
        assert_eq!(all.tools_by_status["active"], 2);

        let p1 = store_stats(conn, Some("p1"), None).unwrap();
        assert_eq!(p1.total_observations, 2);
        assert_eq!(p1.by_classification["durable"], 1);
        assert_eq!(p1.by_classification["unclassified"], 0);
        assert_eq!(p1.open_sessions, 1);
        // global tool visible, p2's tool not
        assert_eq!(p1.tools_by_status["active"], 1);
    }
}
