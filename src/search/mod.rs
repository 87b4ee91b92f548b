//! Hybrid retrieval: FTS5 keyword ranking fused with sqlite-vec similarity.
//!
//! The same machinery serves every indexed entity. A [`Corpus`] names the
//! tables and the scope predicate; [`hybrid_search`] runs keyword search,
//! then (capability and query embedding permitting) vector search, and fuses
//! the two with reciprocal-rank fusion.

pub mod fusion;
pub mod text;
pub mod vector;

use serde::Serialize;
use std::collections::HashMap;

use crate::config::RetrievalConfig;
use crate::db::Store;
use crate::embedding::{EmbeddingProvider, EMBEDDING_DIM};
use crate::error::Result;
use vector::VectorIndex;

// ── Corpora ───────────────────────────────────────────────────────────────────

/// One searchable entity: its base table, indexes, and scope rule.
///
/// `scope_predicate` is an SQL boolean over the base table aliased `b`, bound
/// to the `:partition` parameter. It must exclude everything a partition may
/// not see, since both index paths filter through it.
#[derive(Debug)]
pub struct Corpus {
    pub name: &'static str,
    pub table: &'static str,
    pub fts_table: &'static str,
    pub vec_table: &'static str,
    /// bm25 column weights: (title or name, body).
    pub bm25_weights: (f64, f64),
    pub scope_predicate: &'static str,
}

pub const OBSERVATIONS: Corpus = Corpus {
    name: "observations",
    table: "observations",
    fts_table: "observations_fts",
    vec_table: "observations_vec",
    bm25_weights: (2.0, 1.0),
    scope_predicate: "b.partition_key = :partition \
                      AND b.deleted_at IS NULL \
                      AND (b.classification IS NULL OR b.classification != 'noise')",
};

/// Registry entries visible to a partition: its own plus global rows.
pub const TOOLS: Corpus = Corpus {
    name: "tools",
    table: "tools",
    fts_table: "tools_fts",
    vec_table: "tools_vec",
    bm25_weights: (2.0, 1.0),
    scope_predicate: "(b.partition_key = :partition OR b.partition_key IS NULL) \
                      AND b.status != 'demoted'",
};

// ── Public types ──────────────────────────────────────────────────────────────

/// Which index paths produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Fts,
    Vector,
    Hybrid,
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Fts => "fts",
            Self::Vector => "vector",
            Self::Hybrid => "hybrid",
        })
    }
}

/// A ranked id with its provenance. Callers hydrate the row.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub id: String,
    pub score: f64,
    pub match_type: MatchType,
    /// FTS snippet; `None` for vector-only hits.
    pub snippet: Option<String>,
}

/// Search configuration knobs.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub rrf_k: usize,
    pub vector_overfetch: usize,
    pub snippet_tokens: usize,
}

impl SearchOptions {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for SearchOptions {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            limit: config.default_limit,
            rrf_k: config.rrf_k,
            vector_overfetch: config.vector_overfetch,
            snippet_tokens: config.snippet_tokens,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Keyword search, optionally fused with vector search.
///
/// Vector search runs only when the store has the vector capability and the
/// embedder produced a query vector of the right width. Without vector hits
/// the keyword ranking is returned as is.
pub fn hybrid_search(
    store: &Store,
    corpus: &Corpus,
    query: &str,
    partition: &str,
    options: &SearchOptions,
    embedder: Option<&dyn EmbeddingProvider>,
) -> Result<Vec<RankedHit>> {
    let limit = options.limit;
    if limit == 0 || text::sanitize_query(query).is_none() {
        return Ok(Vec::new());
    }

    let text_hits = text::search(
        store.conn(),
        corpus,
        query,
        partition,
        limit,
        options.snippet_tokens,
    )?;

    let vector_hits = match embedder.filter(|_| store.has_vector()) {
        Some(embedder) => match embed_query(embedder, query) {
            Some(vector) => VectorIndex::new(store.conn(), corpus, true).knn(
                &vector,
                partition,
                limit.saturating_mul(options.vector_overfetch.max(1)),
            ),
            None => Vec::new(),
        },
        None => Vec::new(),
    };

    if vector_hits.is_empty() {
        return Ok(text_hits
            .into_iter()
            .map(|hit| RankedHit {
                id: hit.id,
                score: hit.score,
                match_type: MatchType::Fts,
                snippet: hit.snippet,
            })
            .collect());
    }

    let text_ids: Vec<&str> = text_hits.iter().map(|h| h.id.as_str()).collect();
    let vector_ids: Vec<&str> = vector_hits.iter().map(|(id, _)| id.as_str()).collect();
    let fused = fusion::rrf_fuse(&[&text_ids[..], &vector_ids[..]], options.rrf_k);

    let mut snippets: HashMap<&str, Option<String>> = text_hits
        .iter()
        .map(|h| (h.id.as_str(), h.snippet.clone()))
        .collect();

    let hits = fused
        .into_iter()
        .take(limit)
        .map(|(id, score)| {
            let in_text = snippets.contains_key(id.as_str());
            let in_vector = vector_ids.contains(&id.as_str());
            let match_type = match (in_text, in_vector) {
                (true, true) => MatchType::Hybrid,
                (false, _) => MatchType::Vector,
                (true, false) => MatchType::Fts,
            };
            let snippet = snippets.remove(id.as_str()).flatten();
            RankedHit {
                id,
                score,
                match_type,
                snippet,
            }
        })
        .collect();
    Ok(hits)
}

/// Embed the query, or `None` when the embedder fails or returns the wrong width.
fn embed_query(embedder: &dyn EmbeddingProvider, query: &str) -> Option<Vec<f32>> {
    match embedder.embed(query) {
        Ok(vector) if vector.len() == EMBEDDING_DIM => Some(vector),
        Ok(vector) => {
            tracing::debug!(width = vector.len(), "query embedding has wrong width, keyword-only");
            None
        }
        Err(e) => {
            tracing::debug!(error = %e, "query embedding unavailable, keyword-only");
            None
        }
    }
}
