use std::path::PathBuf;

/// Errors surfaced by the storage engine.
///
/// Lookups that match nothing are not errors: they return `Ok(None)` or
/// `Ok(false)`. A missing vector extension is not an error either.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("migration v{version} ({name}) failed: {source}")]
    Migration {
        version: u32,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background task panicked or its shared state was poisoned.
    #[error("background task failed: {0}")]
    Background(String),
}

impl Error {
    /// `true` when the writer lock could not be acquired within the busy timeout.
    pub fn is_busy(&self) -> bool {
        let err = match self {
            Self::Database(e) => e,
            Self::Migration { source, .. } => source,
            _ => return false,
        };
        matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
