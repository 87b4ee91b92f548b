//! Observation store: append, lookup, list, lifecycle updates, and search.
//!
//! Every read is scoped by partition or addressed by id. Soft-deleted rows are
//! invisible to reads and search but can still be restored by exact id.

use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;

use super::types::{Classification, ListFilter, NewObservation, Observation};
use super::{escape_like, now_timestamp, timestamp_days_ago, truncate_preview, MAX_EMBED_ATTEMPTS};
use crate::db::Store;
use crate::embedding::{embedding_to_bytes, EmbeddingProvider, EMBEDDING_DIM};
use crate::error::{Error, Result};
use crate::search::vector::VectorIndex;
use crate::search::{self, MatchType, SearchOptions, OBSERVATIONS};

const COLUMNS: &str = "id, partition_key, session_id, title, content, source, classification, \
                       embedding IS NOT NULL, created_at, updated_at, deleted_at";

/// Rows the embedding worker still owes a vector. `?1` is the attempt cap.
const UNVECTORIZED: &str = "embedding IS NULL AND deleted_at IS NULL \
                            AND (classification IS NULL OR classification != 'noise') \
                            AND embed_attempts < ?1";

/// Characters of content shown for hits without an FTS snippet.
const PREVIEW_CHARS: usize = 160;

/// A search result with its hydrated row.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationHit {
    pub observation: Observation,
    pub score: f64,
    pub match_type: MatchType,
    pub snippet: String,
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: row.get(0)?,
        partition_key: row.get(1)?,
        session_id: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        source: row.get(5)?,
        classification: row.get(6)?,
        has_embedding: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        deleted_at: row.get(10)?,
    })
}

/// Insert a new observation. The FTS index is kept in step by triggers.
pub fn create(conn: &Connection, new: &NewObservation) -> Result<Observation> {
    if new.partition_key.trim().is_empty() {
        return Err(Error::InvalidInput("partition key must not be empty".into()));
    }
    if new.content.trim().is_empty() {
        return Err(Error::InvalidInput("observation content must not be empty".into()));
    }

    let id = uuid::Uuid::now_v7().to_string();
    let now = now_timestamp();
    let source = new.source.clone().unwrap_or_else(|| "capture".to_string());

    conn.execute(
        "INSERT INTO observations \
         (id, partition_key, session_id, title, content, source, classification, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            id,
            new.partition_key,
            new.session_id,
            new.title,
            new.content,
            source,
            new.classification,
            now,
        ],
    )?;

    tracing::debug!(id = %id, partition = %new.partition_key, "observation created");

    Ok(Observation {
        id,
        partition_key: new.partition_key.clone(),
        session_id: new.session_id.clone(),
        title: new.title.clone(),
        content: new.content.clone(),
        source,
        classification: new.classification,
        has_embedding: false,
        created_at: now.clone(),
        updated_at: now,
        deleted_at: None,
    })
}

/// Look up a live observation by full id or unambiguous id prefix.
///
/// Zero or several prefix matches both yield `None`.
pub fn get_by_id(conn: &Connection, id_or_prefix: &str) -> Result<Option<Observation>> {
    if id_or_prefix.is_empty() {
        return Ok(None);
    }

    let exact = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM observations WHERE id = ?1 AND deleted_at IS NULL"),
            [id_or_prefix],
            map_row,
        )
        .optional()?;
    if exact.is_some() {
        return Ok(exact);
    }

    let pattern = format!("{}%", escape_like(id_or_prefix));
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM observations \
         WHERE id LIKE ?1 ESCAPE '\\' AND deleted_at IS NULL LIMIT 2"
    ))?;
    let mut matches = stmt
        .query_map([pattern], map_row)?
        .collect::<Result<Vec<_>, _>>()?;

    match matches.len() {
        1 => Ok(matches.pop()),
        0 => Ok(None),
        _ => {
            tracing::debug!(prefix = id_or_prefix, "ambiguous id prefix");
            Ok(None)
        }
    }
}

/// Exact-id lookup that also returns soft-deleted rows.
pub fn get_including_deleted(conn: &Connection, id: &str) -> Result<Option<Observation>> {
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM observations WHERE id = ?1"),
            [id],
            map_row,
        )
        .optional()?;
    Ok(row)
}

/// List live observations in one partition, newest first.
///
/// Noise rows are excluded unless the filter asks for `Noise` explicitly.
pub fn list(conn: &Connection, filter: &ListFilter) -> Result<Vec<Observation>> {
    let mut sql = format!(
        "SELECT {COLUMNS} FROM observations \
         WHERE partition_key = :partition AND deleted_at IS NULL"
    );
    let limit = filter.limit as i64;
    let offset = filter.offset as i64;
    let mut bound: Vec<(&str, &dyn ToSql)> = vec![
        (":partition", &filter.partition_key),
        (":limit", &limit),
        (":offset", &offset),
    ];

    match &filter.classification {
        Some(classification) => {
            sql.push_str(" AND classification = :classification");
            bound.push((":classification", classification));
        }
        None => sql.push_str(" AND (classification IS NULL OR classification != 'noise')"),
    }
    if let Some(session_id) = &filter.session_id {
        sql.push_str(" AND session_id = :session");
        bound.push((":session", session_id));
    }
    if let Some(since) = &filter.since {
        sql.push_str(" AND created_at >= :since");
        bound.push((":since", since));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT :limit OFFSET :offset");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(bound.as_slice(), map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Hide an observation from every read path. `false` if it was not live.
pub fn soft_delete(conn: &Connection, id: &str) -> Result<bool> {
    let now = now_timestamp();
    let changed = conn.execute(
        "UPDATE observations SET deleted_at = ?1, updated_at = ?1 \
         WHERE id = ?2 AND deleted_at IS NULL",
        params![now, id],
    )?;
    if changed > 0 {
        tracing::info!(id, "observation soft-deleted");
    }
    Ok(changed > 0)
}

/// Undo a soft delete. `false` if the row is missing or not deleted.
pub fn restore(conn: &Connection, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE observations SET deleted_at = NULL, updated_at = ?1 \
         WHERE id = ?2 AND deleted_at IS NOT NULL",
        params![now_timestamp(), id],
    )?;
    if changed > 0 {
        tracing::info!(id, "observation restored");
    }
    Ok(changed > 0)
}

pub fn update_classification(
    conn: &Connection,
    id: &str,
    classification: Classification,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE observations SET classification = ?1, updated_at = ?2 \
         WHERE id = ?3 AND deleted_at IS NULL",
        params![classification, now_timestamp(), id],
    )?;
    Ok(changed > 0)
}

/// Store a vector for a live observation and index it when the store can.
///
/// The blob is kept even without the vector capability so a later open with
/// the extension can backfill its index.
pub fn update_embedding(store: &Store, id: &str, vector: &[f32]) -> Result<bool> {
    if vector.len() != EMBEDDING_DIM {
        return Err(Error::InvalidInput(format!(
            "embedding has {} dimensions, expected {EMBEDDING_DIM}",
            vector.len()
        )));
    }

    let tx = Transaction::new_unchecked(store.conn(), TransactionBehavior::Immediate)?;
    let changed = tx.execute(
        "UPDATE observations SET embedding = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![embedding_to_bytes(vector), id],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    VectorIndex::new(&tx, &OBSERVATIONS, store.has_vector()).upsert(id, vector);
    tx.commit()?;
    Ok(true)
}

/// Live, non-noise observations that have no vector yet and have not used up
/// their embedding attempts. Never-failed rows come first, oldest first.
pub fn find_unvectorized(conn: &Connection, limit: usize) -> Result<Vec<Observation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM observations \
         WHERE {UNVECTORIZED} \
         ORDER BY embed_attempts, created_at, rowid LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![MAX_EMBED_ATTEMPTS, limit as i64], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Size of the embedding backlog [`find_unvectorized`] draws from.
pub fn count_unvectorized(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM observations WHERE {UNVECTORIZED}"),
        [MAX_EMBED_ATTEMPTS],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Live rows that used up their attempts and will not be embedded.
pub fn count_embed_failed(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM observations \
         WHERE embedding IS NULL AND deleted_at IS NULL AND embed_attempts >= ?1",
        [MAX_EMBED_ATTEMPTS],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Count a failed embedding attempt against `id`. Returns the new total, or
/// `None` if the row is gone.
pub fn record_embed_failure(conn: &Connection, id: &str) -> Result<Option<u32>> {
    let attempts: Option<u32> = conn
        .query_row(
            "UPDATE observations SET embed_attempts = embed_attempts + 1, embed_failed_at = ?1 \
             WHERE id = ?2 RETURNING embed_attempts",
            params![now_timestamp(), id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(attempts) = attempts.filter(|&n| n >= MAX_EMBED_ATTEMPTS) {
        tracing::warn!(id, attempts, "observation dropped from embedding backlog");
    }
    Ok(attempts)
}

/// Live observations, optionally in one partition.
pub fn count(conn: &Connection, partition: Option<&str>) -> Result<u64> {
    let count: i64 = match partition {
        Some(p) => conn.query_row(
            "SELECT COUNT(*) FROM observations WHERE partition_key = ?1 AND deleted_at IS NULL",
            [p],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM observations WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?,
    };
    Ok(count as u64)
}

/// Hard-delete rows soft-deleted at least `older_than_days` ago.
pub fn purge_deleted(store: &Store, older_than_days: u64) -> Result<usize> {
    let cutoff = timestamp_days_ago(older_than_days);
    let tx = Transaction::new_unchecked(store.conn(), TransactionBehavior::Immediate)?;

    let ids: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM observations WHERE deleted_at IS NOT NULL AND deleted_at <= ?1",
        )?;
        let ids = stmt
            .query_map([&cutoff], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let index = VectorIndex::new(&tx, &OBSERVATIONS, store.has_vector());
    for id in &ids {
        index.remove(id);
        tx.execute("DELETE FROM observations WHERE id = ?1", [id])?;
    }
    tx.commit()?;

    if !ids.is_empty() {
        tracing::info!(purged = ids.len(), cutoff = %cutoff, "purged soft-deleted observations");
    }
    Ok(ids.len())
}

/// Hybrid search within one partition, hydrated into full rows.
pub fn search(
    store: &Store,
    query: &str,
    partition: &str,
    options: &SearchOptions,
    embedder: Option<&dyn EmbeddingProvider>,
) -> Result<Vec<ObservationHit>> {
    let hits = search::hybrid_search(store, &OBSERVATIONS, query, partition, options, embedder)?;
    let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    let mut rows = fetch_live(store.conn(), &ids)?;

    let results = hits
        .into_iter()
        .filter_map(|hit| {
            let observation = rows.remove(&hit.id)?;
            let snippet = hit
                .snippet
                .unwrap_or_else(|| truncate_preview(&observation.content, PREVIEW_CHARS));
            Some(ObservationHit {
                observation,
                score: hit.score,
                match_type: hit.match_type,
                snippet,
            })
        })
        .collect();
    Ok(results)
}

/// Batch-fetch live observations by id.
fn fetch_live(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, Observation>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {COLUMNS} FROM observations WHERE deleted_at IS NULL AND id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
    let rows = stmt
        .query_map(params.as_slice(), map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|o| (o.id.clone(), o)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::OpenOptions;

    fn test_store() -> Store {
        Store::open_in_memory(&OpenOptions::default()).unwrap()
    }

    fn spike(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[seed % EMBEDDING_DIM] = 1.0;
        v
    }

    #[test]
    fn create_then_get_by_full_id_and_prefix() {
        let store = test_store();
        let created = create(
            store.conn(),
            &NewObservation::new("p1", "Cargo workspaces share one lockfile").title("cargo"),
        )
        .unwrap();

        let by_id = get_by_id(store.conn(), &created.id).unwrap().unwrap();
        assert_eq!(by_id, created);
        assert_eq!(by_id.source, "capture");

        // Only one row, so any prefix is unambiguous.
        let prefix = &created.id[..created.id.len() - 4];
        assert_eq!(get_by_id(store.conn(), prefix).unwrap().unwrap().id, created.id);
    }

    #[test]
    fn ambiguous_prefix_is_not_found() {
        let store = test_store();
        let a = create(store.conn(), &NewObservation::new("p1", "first")).unwrap();
        let b = create(store.conn(), &NewObservation::new("p1", "second")).unwrap();

        let common: String = a
            .id
            .chars()
            .zip(b.id.chars())
            .take_while(|(x, y)| x == y)
            .map(|(x, _)| x)
            .collect();
        assert!(!common.is_empty());
        assert!(get_by_id(store.conn(), &common).unwrap().is_none());
        assert!(get_by_id(store.conn(), "").unwrap().is_none());
    }

    #[test]
    fn like_wildcards_in_prefix_are_literal() {
        let store = test_store();
        create(store.conn(), &NewObservation::new("p1", "only one")).unwrap();
        assert!(get_by_id(store.conn(), "%").unwrap().is_none());
        assert!(get_by_id(store.conn(), "_").unwrap().is_none());
    }

    #[test]
    fn empty_content_is_rejected() {
        let store = test_store();
        let err = create(store.conn(), &NewObservation::new("p1", "   ")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn list_excludes_noise_unless_requested() {
        let store = test_store();
        create(store.conn(), &NewObservation::new("p1", "signal")).unwrap();
        create(
            store.conn(),
            &NewObservation::new("p1", "chatter").classification(Classification::Noise),
        )
        .unwrap();

        let default = list(store.conn(), &ListFilter::partition("p1")).unwrap();
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].content, "signal");

        let mut noise_only = ListFilter::partition("p1");
        noise_only.classification = Some(Classification::Noise);
        let noise = list(store.conn(), &noise_only).unwrap();
        assert_eq!(noise.len(), 1);
        assert_eq!(noise[0].content, "chatter");
    }

    #[test]
    fn list_filters_by_session_and_paginates() {
        let store = test_store();
        for i in 0..5 {
            create(
                store.conn(),
                &NewObservation::new("p1", format!("in session {i}")).session("s1"),
            )
            .unwrap();
        }
        create(store.conn(), &NewObservation::new("p1", "elsewhere").session("s2")).unwrap();

        let mut filter = ListFilter::partition("p1");
        filter.session_id = Some("s1".into());
        filter.limit = 2;
        let first = list(store.conn(), &filter).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].content, "in session 4");

        filter.offset = 4;
        let last = list(store.conn(), &filter).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].content, "in session 0");
    }

    #[test]
    fn soft_delete_is_idempotent() {
        let store = test_store();
        let o = create(store.conn(), &NewObservation::new("p1", "ephemeral")).unwrap();

        assert!(soft_delete(store.conn(), &o.id).unwrap());
        assert!(!soft_delete(store.conn(), &o.id).unwrap());
        assert!(get_by_id(store.conn(), &o.id).unwrap().is_none());
        assert!(get_including_deleted(store.conn(), &o.id).unwrap().unwrap().deleted_at.is_some());

        assert!(restore(store.conn(), &o.id).unwrap());
        assert!(!restore(store.conn(), &o.id).unwrap());
        assert!(!soft_delete(store.conn(), "missing").unwrap());
    }

    #[test]
    fn update_embedding_checks_width() {
        let store = test_store();
        let o = create(store.conn(), &NewObservation::new("p1", "vectorize me")).unwrap();

        let err = update_embedding(&store, &o.id, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        assert_eq!(count_unvectorized(store.conn()).unwrap(), 1);
        assert!(update_embedding(&store, &o.id, &spike(3)).unwrap());
        assert_eq!(count_unvectorized(store.conn()).unwrap(), 0);
        assert!(get_by_id(store.conn(), &o.id).unwrap().unwrap().has_embedding);
        assert!(!update_embedding(&store, "missing", &spike(3)).unwrap());
    }

    #[test]
    fn embedding_stored_without_vector_capability() {
        let store = Store::open_in_memory(&OpenOptions::default().vector_extension(false)).unwrap();
        let o = create(store.conn(), &NewObservation::new("p1", "keyword only")).unwrap();
        assert!(update_embedding(&store, &o.id, &spike(1)).unwrap());
        assert!(find_unvectorized(store.conn(), 10).unwrap().is_empty());
    }

    #[test]
    fn find_unvectorized_is_oldest_first_and_bounded() {
        let store = test_store();
        for i in 0..4 {
            create(store.conn(), &NewObservation::new("p1", format!("row {i}"))).unwrap();
        }
        let batch = find_unvectorized(store.conn(), 3).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].content, "row 0");
    }

    #[test]
    fn failed_rows_yield_to_fresh_ones_then_leave_the_backlog() {
        let store = test_store();
        let bad = create(store.conn(), &NewObservation::new("p1", "unembeddable")).unwrap();
        create(store.conn(), &NewObservation::new("p1", "fine")).unwrap();

        assert_eq!(record_embed_failure(store.conn(), &bad.id).unwrap(), Some(1));
        let batch = find_unvectorized(store.conn(), 1).unwrap();
        assert_eq!(batch[0].content, "fine");
        assert_eq!(count_unvectorized(store.conn()).unwrap(), 2);

        for _ in 1..MAX_EMBED_ATTEMPTS {
            record_embed_failure(store.conn(), &bad.id).unwrap();
        }
        assert_eq!(count_unvectorized(store.conn()).unwrap(), 1);
        assert_eq!(count_embed_failed(store.conn()).unwrap(), 1);
        assert!(find_unvectorized(store.conn(), 10).unwrap().iter().all(|o| o.id != bad.id));
        assert_eq!(record_embed_failure(store.conn(), "missing").unwrap(), None);
    }

    #[test]
    fn purge_removes_only_old_deleted_rows() {
        let store = test_store();
        let keep = create(store.conn(), &NewObservation::new("p1", "keep")).unwrap();
        let gone = create(store.conn(), &NewObservation::new("p1", "gone")).unwrap();
        update_embedding(&store, &gone.id, &spike(7)).unwrap();
        soft_delete(store.conn(), &gone.id).unwrap();

        // Deleted just now: not older than one day.
        assert_eq!(purge_deleted(&store, 1).unwrap(), 0);
        assert_eq!(purge_deleted(&store, 0).unwrap(), 1);

        assert!(get_including_deleted(store.conn(), &gone.id).unwrap().is_none());
        assert!(get_by_id(store.conn(), &keep.id).unwrap().is_some());
        let index = VectorIndex::new(store.conn(), &OBSERVATIONS, store.has_vector());
        assert!(!index.has_vector(&gone.id));
    }

    #[test]
    fn search_hydrates_rows_with_snippets() {
        let store = test_store();
        create(
            store.conn(),
            &NewObservation::new("p1", "The borrow checker rejected the closure").title("borrowck"),
        )
        .unwrap();
        create(store.conn(), &NewObservation::new("p1", "Unrelated lunch notes")).unwrap();

        let hits = search(&store, "closure", "p1", &SearchOptions::default(), None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].match_type, MatchType::Fts);
        assert!(hits[0].snippet.contains("[closure]"));
    }

    #[test]
    fn count_ignores_deleted_rows() {
        let store = test_store();
        let a = create(store.conn(), &NewObservation::new("p1", "a")).unwrap();
        create(store.conn(), &NewObservation::new("p2", "b")).unwrap();
        soft_delete(store.conn(), &a.id).unwrap();

        assert_eq!(count(store.conn(), None).unwrap(), 1);
        assert_eq!(count(store.conn(), Some("p1")).unwrap(), 0);
    }
}
