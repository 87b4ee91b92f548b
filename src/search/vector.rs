//! sqlite-vec KNN index.
//!
//! Every method degrades instead of failing: with the capability absent, or on
//! any index-level error, calls return empty/false and log at debug. The index
//! has no partition concept; scoping happens by joining back to the corpus
//! table.
//!
//! KNN therefore ranks the whole index before the scope filter applies. When
//! too few neighbours survive the filter, `k` is widened until the limit is
//! met, the index is exhausted, or sqlite-vec's cap on `k` is reached. A small
//! partition in a store with more than that cap of closer vectors elsewhere
//! gets no vector hits and is served by the text path alone.

use rusqlite::{named_params, params, Connection, OptionalExtension};

use super::Corpus;
use crate::embedding::{embedding_to_bytes, EMBEDDING_DIM};

/// sqlite-vec's upper bound on `k`.
const MAX_KNN_K: usize = 4096;

/// Neighbours fetched from the index per requested result, so rows dropped by
/// the scope join still leave enough candidates.
const SCOPE_OVERFETCH: usize = 8;

/// Growth of `k` per retry when the scope filter leaves too few hits.
const WIDEN_FACTOR: usize = 4;

/// View of one corpus's vector table on a connection.
#[derive(Clone, Copy)]
pub struct VectorIndex<'a> {
    conn: &'a Connection,
    corpus: &'a Corpus,
    enabled: bool,
}

impl<'a> VectorIndex<'a> {
    /// `enabled` is the connection's vector capability flag.
    pub fn new(conn: &'a Connection, corpus: &'a Corpus, enabled: bool) -> Self {
        Self {
            conn,
            corpus,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Insert or replace the vector for `id`. Returns `true` if indexed.
    pub fn upsert(&self, id: &str, vector: &[f32]) -> bool {
        if !self.enabled {
            return false;
        }
        if vector.len() != EMBEDDING_DIM {
            tracing::debug!(id, width = vector.len(), "vector width mismatch, not indexed");
            return false;
        }

        // vec0 has no upsert; delete then insert.
        let result = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.corpus.vec_table),
                [id],
            )
            .and_then(|_| {
                self.conn.execute(
                    &format!("INSERT INTO {} (id, embedding) VALUES (?1, ?2)", self.corpus.vec_table),
                    params![id, embedding_to_bytes(vector)],
                )
            });
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(corpus = self.corpus.name, id, error = %e, "vector upsert failed");
                false
            }
        }
    }

    /// Remove the vector for `id`, if any.
    pub fn remove(&self, id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", self.corpus.vec_table),
                [id],
            )
            .map(|n| n > 0)
            .unwrap_or_else(|e| {
                tracing::debug!(corpus = self.corpus.name, id, error = %e, "vector delete failed");
                false
            })
    }

    pub fn has_vector(&self, id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        self.conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", self.corpus.vec_table),
                [id],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .unwrap_or_else(|e| {
                tracing::debug!(corpus = self.corpus.name, id, error = %e, "vector lookup failed");
                false
            })
    }

    /// Nearest neighbours within `partition`'s scope as `(id, cosine distance)`,
    /// closest first.
    pub fn knn(&self, query: &[f32], partition: &str, limit: usize) -> Vec<(String, f64)> {
        if !self.enabled || limit == 0 || query.len() != EMBEDDING_DIM {
            return Vec::new();
        }
        match self.try_knn(query, partition, limit) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::debug!(corpus = self.corpus.name, error = %e, "vector search failed");
                Vec::new()
            }
        }
    }

    fn try_knn(
        &self,
        query: &[f32],
        partition: &str,
        limit: usize,
    ) -> rusqlite::Result<Vec<(String, f64)>> {
        let mut k = limit.saturating_mul(SCOPE_OVERFETCH).min(MAX_KNN_K);
        let mut indexed: Option<usize> = None;
        loop {
            let hits = self.knn_round(query, partition, limit, k)?;
            if hits.len() >= limit || k >= MAX_KNN_K {
                return Ok(hits);
            }
            let total = match indexed {
                Some(total) => total,
                None => *indexed.insert(self.indexed_count()?),
            };
            if k >= total {
                return Ok(hits);
            }
            k = k.saturating_mul(WIDEN_FACTOR).min(MAX_KNN_K);
            tracing::trace!(corpus = self.corpus.name, partition, k, "widening vector search");
        }
    }

    fn knn_round(
        &self,
        query: &[f32],
        partition: &str,
        limit: usize,
        k: usize,
    ) -> rusqlite::Result<Vec<(String, f64)>> {
        let sql = format!(
            "SELECT b.id, v.distance \
             FROM (SELECT id, distance FROM {vec} WHERE embedding MATCH :vector AND k = :k) v \
             JOIN {table} b ON b.id = v.id \
             WHERE {scope} \
             ORDER BY v.distance \
             LIMIT :limit",
            vec = self.corpus.vec_table,
            table = self.corpus.table,
            scope = self.corpus.scope_predicate,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let hits = stmt
            .query_map(
                named_params! {
                    ":vector": embedding_to_bytes(query),
                    ":k": k as i64,
                    ":partition": partition,
                    ":limit": limit as i64,
                },
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(hits)
    }

    fn indexed_count(&self) -> rusqlite::Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.corpus.vec_table),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{OpenOptions, Store};
    use crate::search::OBSERVATIONS;

    #[test]
    fn disabled_index_is_a_no_op() {
        let store = Store::open_in_memory(&OpenOptions::default().vector_extension(false)).unwrap();
        let index = VectorIndex::new(store.conn(), &OBSERVATIONS, store.has_vector());
        let v = vec![0.5f32; EMBEDDING_DIM];

        assert!(!index.upsert("x", &v));
        assert!(!index.has_vector("x"));
        assert!(index.knn(&v, "p1", 5).is_empty());
        assert!(!index.remove("x"));
    }

    #[test]
    fn missing_table_is_swallowed() {
        // Capability claimed but the vec table was never created.
        let store = Store::open_in_memory(&OpenOptions::default().vector_extension(false)).unwrap();
        let index = VectorIndex::new(store.conn(), &OBSERVATIONS, true);
        let v = vec![0.5f32; EMBEDDING_DIM];

        assert!(!index.upsert("x", &v));
        assert!(index.knn(&v, "p1", 5).is_empty());
    }

    #[test]
    fn wrong_width_is_rejected() {
        let store = Store::open_in_memory(&OpenOptions::default()).unwrap();
        let index = VectorIndex::new(store.conn(), &OBSERVATIONS, store.has_vector());
        assert!(!index.upsert("x", &[1.0, 0.0]));
        assert!(index.knn(&[1.0, 0.0], "p1", 5).is_empty());
    }
}
