//! SQL DDL and schema procedures referenced by the migration list.
//!
//! Every statement is idempotent (`IF NOT EXISTS`, column checks) so a
//! migration interrupted before its version row committed can simply run again.

use rusqlite::Connection;

use crate::embedding::EMBEDDING_DIM;

/// v1: primary entity, sessions, key/value metadata.
pub const CORE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS observations (
    id TEXT PRIMARY KEY,
    partition_key TEXT NOT NULL,
    session_id TEXT,
    title TEXT,
    content TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'capture',
    classification TEXT CHECK(classification IS NULL OR classification IN ('transient','working','durable','noise')),
    embedding BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_observations_partition_created ON observations(partition_key, created_at);
CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(session_id);
CREATE INDEX IF NOT EXISTS idx_observations_unembedded ON observations(created_at)
    WHERE embedding IS NULL AND deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    partition_key TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    summary TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_partition_started ON sessions(partition_key, started_at);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// v2: external-content FTS5 index over observations, kept in sync by triggers.
///
/// The update trigger only fires for indexed columns, so classification and
/// soft-delete updates do not churn the index.
pub const OBSERVATIONS_FTS_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    title,
    content,
    content='observations',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS observations_fts_insert AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, title, content) VALUES (new.rowid, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS observations_fts_delete AFTER DELETE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
END;

CREATE TRIGGER IF NOT EXISTS observations_fts_update AFTER UPDATE OF title, content ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
    INSERT INTO observations_fts(rowid, title, content) VALUES (new.rowid, new.title, new.content);
END;

INSERT INTO observations_fts(observations_fts) VALUES ('rebuild');
"#;

/// v3: session-final EWMA state, one row per checkpointed session.
pub const THRESHOLD_HISTORY_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS threshold_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    partition_key TEXT NOT NULL,
    session_id TEXT NOT NULL,
    ewma_distance REAL NOT NULL,
    ewma_variance REAL NOT NULL,
    observation_count INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_threshold_history_partition ON threshold_history(partition_key, id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_threshold_history_session ON threshold_history(session_id);
"#;

/// v4: tool registry. A global row (NULL partition) and a partition-local row
/// with the same name are distinct entries.
pub const TOOL_REGISTRY_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tools (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    partition_key TEXT,
    scope TEXT NOT NULL DEFAULT 'global' CHECK(scope IN ('global','project','plugin')),
    status TEXT NOT NULL DEFAULT 'active' CHECK(status IN ('active','stale','demoted')),
    usage_count INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    embedding BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tools_name_partition ON tools(name, COALESCE(partition_key, ''));
CREATE INDEX IF NOT EXISTS idx_tools_partition_status ON tools(partition_key, status);

CREATE VIRTUAL TABLE IF NOT EXISTS tools_fts USING fts5(
    name,
    description,
    content='tools',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS tools_fts_insert AFTER INSERT ON tools BEGIN
    INSERT INTO tools_fts(rowid, name, description) VALUES (new.rowid, new.name, new.description);
END;

CREATE TRIGGER IF NOT EXISTS tools_fts_delete AFTER DELETE ON tools BEGIN
    INSERT INTO tools_fts(tools_fts, rowid, name, description)
    VALUES ('delete', old.rowid, old.name, old.description);
END;

CREATE TRIGGER IF NOT EXISTS tools_fts_update AFTER UPDATE OF name, description ON tools BEGIN
    INSERT INTO tools_fts(tools_fts, rowid, name, description)
    VALUES ('delete', old.rowid, old.name, old.description);
    INSERT INTO tools_fts(rowid, name, description) VALUES (new.rowid, new.name, new.description);
END;
"#;

/// v5: usage timestamps on the registry. Older stores may already carry them.
pub fn add_registry_usage_columns(conn: &Connection) -> rusqlite::Result<()> {
    add_column_if_absent(conn, "tools", "last_used_at", "TEXT")?;
    add_column_if_absent(conn, "tools", "status_changed_at", "TEXT")?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_tools_last_used ON tools(status, last_used_at);",
    )
}

/// v6 (vector capability only): vec0 tables for both corpora, backfilled from
/// embeddings stored while the extension was unavailable.
pub fn create_vector_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS observations_vec USING vec0(
             id TEXT PRIMARY KEY,
             embedding float[{EMBEDDING_DIM}] distance_metric=cosine
         );
         CREATE VIRTUAL TABLE IF NOT EXISTS tools_vec USING vec0(
             id TEXT PRIMARY KEY,
             embedding float[{EMBEDDING_DIM}] distance_metric=cosine
         );"
    ))?;
    backfill_vector_indexes(conn)?;
    Ok(())
}

/// v7: per-row embedding attempt counters, so rows the embedder keeps
/// rejecting drop out of the backlog instead of blocking it.
pub fn add_embedding_attempt_columns(conn: &Connection) -> rusqlite::Result<()> {
    for table in ["observations", "tools"] {
        add_column_if_absent(conn, table, "embed_attempts", "INTEGER NOT NULL DEFAULT 0")?;
        add_column_if_absent(conn, table, "embed_failed_at", "TEXT")?;
    }
    Ok(())
}

/// Copy stored embedding blobs that have no vec0 row into the vector indexes.
///
/// Runs inside v6 and again on every open with the vector capability, which
/// picks up vectors written by keyword-only connections after v6. Returns
/// `(observations, tools)` rows indexed. Only writes when something is missing.
pub fn backfill_vector_indexes(conn: &Connection) -> rusqlite::Result<(usize, usize)> {
    let blob_len = (EMBEDDING_DIM * std::mem::size_of::<f32>()) as i64;
    let mut indexed = [0usize; 2];
    for (slot, (table, vec_table, live)) in [
        ("observations", "observations_vec", "b.deleted_at IS NULL"),
        ("tools", "tools_vec", "1"),
    ]
    .into_iter()
    .enumerate()
    {
        let missing_rows = format!(
            "FROM {table} b \
             WHERE b.embedding IS NOT NULL AND length(b.embedding) = ?1 AND {live} \
               AND NOT EXISTS (SELECT 1 FROM {vec_table} v WHERE v.id = b.id)"
        );
        let missing: i64 =
            conn.query_row(&format!("SELECT COUNT(*) {missing_rows}"), [blob_len], |row| row.get(0))?;
        if missing > 0 {
            indexed[slot] = conn.execute(
                &format!("INSERT INTO {vec_table} (id, embedding) SELECT b.id, b.embedding {missing_rows}"),
                [blob_len],
            )?;
        }
    }

    let [observations, tools] = indexed;
    if observations + tools > 0 {
        tracing::info!(observations, tools, "backfilled vector indexes from stored embeddings");
    }
    Ok((observations, tools))
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}

fn add_column_if_absent(
    conn: &Connection,
    table: &str,
    column: &str,
    col_type: &str,
) -> rusqlite::Result<()> {
    if !column_exists(conn, table, column)? {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {col_type};"))?;
    }
    Ok(())
}
