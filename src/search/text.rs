//! FTS5 keyword search shared by both corpora.

use rusqlite::{named_params, Connection};

use super::Corpus;
use crate::error::Result;

/// FTS5 operators that must never reach `MATCH` as bare tokens.
const RESERVED: &[&str] = &["AND", "OR", "NOT", "NEAR"];

/// FTS5 rejects snippet lengths outside this range.
const MAX_SNIPPET_TOKENS: usize = 64;

/// A keyword hit, best first.
#[derive(Debug, Clone)]
pub struct TextHit {
    pub id: String,
    /// Negated bm25, so larger is better.
    pub score: f64,
    pub snippet: Option<String>,
}

/// Turn free text into a safe FTS5 expression.
///
/// Each whitespace-separated token is stripped of everything but
/// alphanumerics and `_`; reserved operators are dropped. Survivors are quoted
/// and joined with `OR`. Returns `None` when nothing survives.
pub fn sanitize_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .filter(|token| !RESERVED.iter().any(|kw| token.eq_ignore_ascii_case(kw)))
        .map(|token| format!("\"{token}\""))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Ranked keyword search within one partition scope.
///
/// A query that sanitizes to nothing returns no hits.
pub fn search(
    conn: &Connection,
    corpus: &Corpus,
    query: &str,
    partition: &str,
    limit: usize,
    snippet_tokens: usize,
) -> Result<Vec<TextHit>> {
    let Some(fts_query) = sanitize_query(query) else {
        tracing::debug!(corpus = corpus.name, "query sanitized to nothing");
        return Ok(Vec::new());
    };
    if limit == 0 {
        return Ok(Vec::new());
    }

    let fts = corpus.fts_table;
    let (primary_weight, body_weight) = corpus.bm25_weights;
    let sql = format!(
        "SELECT b.id, bm25({fts}, {primary_weight:.1}, {body_weight:.1}) AS score, \
                snippet({fts}, -1, '[', ']', '...', :tokens) \
         FROM {fts} f \
         JOIN {table} b ON b.rowid = f.rowid \
         WHERE {fts} MATCH :query AND {scope} \
         ORDER BY score \
         LIMIT :limit",
        table = corpus.table,
        scope = corpus.scope_predicate,
    );

    let mut stmt = conn.prepare(&sql)?;
    let hits = stmt
        .query_map(
            named_params! {
                ":query": fts_query,
                ":partition": partition,
                ":tokens": snippet_tokens.clamp(1, MAX_SNIPPET_TOKENS) as i64,
                ":limit": limit as i64,
            },
            |row| {
                Ok(TextHit {
                    id: row.get(0)?,
                    score: -row.get::<_, f64>(1)?,
                    snippet: row.get(2)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}
