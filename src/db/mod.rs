//! Connection lifecycle: open, pragma setup, optional vector extension,
//! migrations, checkpointing, and close.
//!
//! A [`Store`] owns exactly one SQLite connection. Components borrow it; nothing
//! in the crate holds a process-global handle, so several stores can coexist
//! (tests open many). Other processes may hold their own connections to the
//! same file at any time.

pub mod migrations;
pub mod schema;

use rusqlite::{ffi, Connection, OpenFlags};
use serde::Serialize;
use std::os::raw::{c_char, c_int, c_void};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::StorageConfig;
use crate::embedding::EMBEDDING_DIM;
use crate::error::{Error, Result};
use migrations::{Capability, MigrationReport};

/// Migration that creates the vec0 tables.
const VECTOR_INDEX_VERSION: u32 = 6;

/// Connection-level settings applied on every open.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub busy_timeout: Duration,
    pub cache_size_kib: i64,
    pub wal_autocheckpoint_pages: u32,
    pub load_vector_extension: bool,
}

impl OpenOptions {
    pub fn new(busy_timeout: Duration) -> Self {
        Self {
            busy_timeout,
            cache_size_kib: 8192,
            wal_autocheckpoint_pages: 1000,
            load_vector_extension: true,
        }
    }

    pub fn vector_extension(mut self, enabled: bool) -> Self {
        self.load_vector_extension = enabled;
        self
    }

    pub fn cache_size_kib(mut self, kib: i64) -> Self {
        self.cache_size_kib = kib;
        self
    }

    pub fn wal_autocheckpoint_pages(mut self, pages: u32) -> Self {
        self.wal_autocheckpoint_pages = pages;
        self
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new(Duration::from_millis(5000))
    }
}

impl From<&StorageConfig> for OpenOptions {
    fn from(config: &StorageConfig) -> Self {
        Self::new(Duration::from_millis(config.busy_timeout_ms))
            .cache_size_kib(config.cache_size_kib)
            .wal_autocheckpoint_pages(config.wal_autocheckpoint_pages)
            .vector_extension(config.vector_extension)
    }
}

/// Optional features detected at open. Fixed for the connection's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Capabilities {
    pub vector: bool,
    pub vector_version: Option<String>,
}

impl Capabilities {
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Vector => self.vector,
        }
    }
}

/// Result of a `wal_checkpoint(PASSIVE)`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckpointStats {
    /// `true` if a concurrent writer or reader prevented a full checkpoint.
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// Diagnostics for `cairn doctor`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub journal_mode: String,
    pub applied_versions: Vec<u32>,
    pub pending_versions: Vec<u32>,
    pub capabilities: Capabilities,
    pub observation_count: u64,
    pub tool_count: u64,
}

/// The single owned connection to a cairn database file.
pub struct Store {
    conn: Connection,
    capabilities: Capabilities,
    path: Option<PathBuf>,
    migration_report: MigrationReport,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store at `path`.
    ///
    /// Order matters: WAL must be active before `synchronous=NORMAL` is safe,
    /// and the busy timeout is per connection so it is set on every open.
    pub fn open(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| Error::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;

        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(
                path = %path.display(),
                journal_mode = %mode,
                "write-ahead logging unavailable; concurrent readers will block on writes"
            );
        }

        let store = Self::finish_open(conn, Some(path.to_path_buf()), options)?;
        tracing::info!(
            path = %path.display(),
            vector = store.capabilities.vector,
            applied = ?store.migration_report.applied,
            "store opened"
        );
        Ok(store)
    }

    /// Open a private in-memory store. Journal mode stays `memory`.
    pub fn open_in_memory(options: &OpenOptions) -> Result<Self> {
        let conn = Connection::open_with_flags(
            ":memory:",
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::finish_open(conn, None, options)
    }

    fn finish_open(conn: Connection, path: Option<PathBuf>, options: &OpenOptions) -> Result<Self> {
        conn.busy_timeout(options.busy_timeout)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "cache_size", -options.cache_size_kib)?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "wal_autocheckpoint", options.wal_autocheckpoint_pages)?;

        let capabilities = if options.load_vector_extension {
            match load_vector_extension(&conn) {
                Ok(version) => Capabilities {
                    vector: true,
                    vector_version: Some(version),
                },
                Err(reason) => {
                    tracing::debug!(%reason, "sqlite-vec unavailable, keyword-only search");
                    Capabilities::default()
                }
            }
        } else {
            Capabilities::default()
        };

        let migration_report = migrations::apply_pending(&conn, &capabilities)?;
        if capabilities.vector && !migration_report.applied.contains(&VECTOR_INDEX_VERSION) {
            // v6 ran on an earlier open; index what keyword-only connections
            // have embedded since.
            schema::backfill_vector_indexes(&conn)?;
        }
        check_embedding_dimensions(&conn)?;

        Ok(Self {
            conn,
            capabilities,
            path,
            migration_report,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Shorthand for the vector capability flag.
    pub fn has_vector(&self) -> bool {
        self.capabilities.vector
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Migrations applied or skipped while opening this connection.
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration_report
    }

    /// Passive WAL checkpoint: flushes what it can without waiting on readers
    /// or writers in other processes.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        let stats = self
            .conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| {
                Ok(CheckpointStats {
                    busy: row.get::<_, i64>(0)? != 0,
                    log_frames: row.get(1)?,
                    checkpointed_frames: row.get(2)?,
                })
            })?;
        tracing::debug!(?stats, "wal checkpoint");
        Ok(stats)
    }

    /// Rebuild both full-text indexes from their content tables.
    pub fn rebuild_text_index(&self) -> Result<()> {
        self.conn.execute_batch(
            "INSERT INTO observations_fts(observations_fts) VALUES ('rebuild');
             INSERT INTO tools_fts(tools_fts) VALUES ('rebuild');",
        )?;
        tracing::info!("rebuilt full-text indexes");
        Ok(())
    }

    /// Integrity and schema diagnostics.
    pub fn health(&self) -> Result<HealthReport> {
        let integrity_details: String =
            self.conn
                .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String =
            self.conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let applied = migrations::applied_versions(&self.conn)?;
        let pending_versions = migrations::MIGRATIONS
            .iter()
            .map(|m| m.version)
            .filter(|v| !applied.contains(v))
            .collect();
        let observation_count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?;
        let tool_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tools", [], |row| row.get(0))?;

        Ok(HealthReport {
            integrity_ok: integrity_details == "ok",
            integrity_details,
            journal_mode,
            applied_versions: applied.into_iter().collect(),
            pending_versions,
            capabilities: self.capabilities.clone(),
            observation_count: observation_count as u64,
            tool_count: tool_count as u64,
        })
    }

    /// Checkpoint (best effort) and release the connection.
    ///
    /// The handle is released even when the checkpoint fails, e.g. because
    /// another process holds the write lock.
    pub fn close(self) {
        if self.path.is_some() {
            if let Err(e) = self.checkpoint() {
                tracing::debug!(error = %e, "checkpoint on close failed");
            }
        }
        if let Err((_conn, e)) = self.conn.close() {
            tracing::warn!(error = %e, "close failed; connection dropped");
        }
    }
}

/// sqlite-vec's entry point, declared without arguments by the crate.
type VecInitFn = unsafe extern "C" fn(*mut ffi::sqlite3, *mut *mut c_char, *const c_void) -> c_int;

/// Register sqlite-vec on this connection only and return its version.
///
/// Loading per connection (rather than via `sqlite3_auto_extension`) keeps the
/// capability a property of the handle, so stores opened with the extension
/// disabled in the same process stay keyword-only.
fn load_vector_extension(conn: &Connection) -> std::result::Result<String, String> {
    let rc = unsafe {
        let init: VecInitFn = std::mem::transmute(sqlite_vec::sqlite3_vec_init as *const ());
        init(conn.handle(), std::ptr::null_mut(), std::ptr::null())
    };
    if rc != ffi::SQLITE_OK {
        return Err(format!("sqlite3_vec_init returned {rc}"));
    }
    conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
        .map_err(|e| e.to_string())
}

/// Record the compiled embedding width; warn if the store was built with another.
fn check_embedding_dimensions(conn: &Connection) -> Result<()> {
    let compiled = EMBEDDING_DIM.to_string();
    match migrations::get_meta(conn, "embedding_dimensions")? {
        Some(stored) if stored != compiled => {
            tracing::warn!(
                stored = %stored,
                compiled = %compiled,
                "embedding width changed; stored vectors will not be searchable"
            );
        }
        Some(_) => {}
        None => migrations::set_meta(conn, "embedding_dimensions", &compiled)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_applies_schema() {
        let store = Store::open_in_memory(&OpenOptions::default()).unwrap();
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(store.migration_report().applied.contains(&1));
    }

    #[test]
    fn disabled_extension_reports_keyword_only() {
        let options = OpenOptions::default().vector_extension(false);
        let store = Store::open_in_memory(&options).unwrap();
        assert!(!store.has_vector());
        assert_eq!(store.migration_report().skipped, vec![6]);
    }

    #[test]
    fn extension_loads_per_connection() {
        let with = Store::open_in_memory(&OpenOptions::default()).unwrap();
        let without = Store::open_in_memory(&OpenOptions::default().vector_extension(false)).unwrap();

        assert!(with.has_vector());
        assert!(with.capabilities().vector_version.is_some());
        assert!(!without.has_vector());
        let lookup = without
            .conn()
            .query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0));
        assert!(lookup.is_err(), "extension must not leak into other connections");
    }

    #[test]
    fn embedding_dimensions_recorded() {
        let store = Store::open_in_memory(&OpenOptions::default()).unwrap();
        let stored = migrations::get_meta(store.conn(), "embedding_dimensions").unwrap();
        assert_eq!(stored, Some(EMBEDDING_DIM.to_string()));
    }

    #[test]
    fn health_report_on_fresh_store() {
        let store = Store::open_in_memory(&OpenOptions::default()).unwrap();
        let report = store.health().unwrap();
        assert!(report.integrity_ok);
        assert!(report.pending_versions.is_empty());
        assert_eq!(report.observation_count, 0);
    }
}
