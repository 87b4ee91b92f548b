//! Record types for the partitioned store.
//!
//! Defines [`Observation`] (the primary entity) with its lifecycle
//! [`Classification`], [`Session`], and the registry's [`RegistryEntry`] with
//! [`ToolScope`] and [`ToolStatus`].

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Implements `Display`, `FromStr` and the rusqlite conversions for a
/// closed string enum with an `as_str` method.
macro_rules! text_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// SQL-compatible string representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!(concat!("unknown ", $what, ": {}"), s)),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

/// Lifecycle tag assigned by the classification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Relevant only to the moment it was captured.
    Transient,
    /// Useful for the current stretch of work.
    Working,
    /// Worth keeping across sessions.
    Durable,
    /// Stored but excluded from every retrieval path.
    Noise,
}

text_enum!(Classification, "classification", {
    Transient => "transient",
    Working => "working",
    Durable => "durable",
    Noise => "noise",
});

/// Visibility class of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolScope {
    Global,
    /// Local to one partition.
    Project,
    /// Shipped inside a plugin bundle.
    Plugin,
}

text_enum!(ToolScope, "tool scope", {
    Global => "global",
    Project => "project",
    Plugin => "plugin",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Active,
    /// Unused for a while; still searchable.
    Stale,
    /// Unused for long enough to drop out of search.
    Demoted,
}

text_enum!(ToolStatus, "tool status", {
    Active => "active",
    Stale => "stale",
    Demoted => "demoted",
});

/// An observation record, matching the `observations` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    pub partition_key: String,
    pub session_id: Option<String>,
    pub title: Option<String>,
    pub content: String,
    /// Provenance tag, e.g. `"capture"` or `"import"`.
    pub source: String,
    /// `None` until the classification pipeline has run.
    pub classification: Option<Classification>,
    /// Whether a vector has been stored for this row.
    pub has_embedding: bool,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

/// Input for [`create`](crate::memory::observations::create).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewObservation {
    pub partition_key: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub classification: Option<Classification>,
}

impl NewObservation {
    pub fn new(partition_key: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }
}

/// Filters for [`list`](crate::memory::observations::list).
///
/// The partition is mandatory; there is no way to list across partitions.
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub partition_key: String,
    /// When set, only rows with this classification. `Noise` rows are
    /// returned only when explicitly requested here.
    pub classification: Option<Classification>,
    pub session_id: Option<String>,
    /// Inclusive lower bound on `created_at` (RFC 3339).
    pub since: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl ListFilter {
    pub fn partition(partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            classification: None,
            session_id: None,
            since: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// A partition-scoped working session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub partition_key: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub summary: Option<String>,
}

/// A registry row, matching the `tools` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    /// `None` for global entries.
    pub partition_key: Option<String>,
    pub scope: ToolScope,
    pub status: ToolStatus,
    pub usage_count: i64,
    pub last_used_at: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub status_changed_at: Option<String>,
}

/// Values used when a registry row is created rather than updated.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDefaults {
    pub scope: ToolScope,
    #[serde(default)]
    pub description: Option<String>,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self {
            scope: ToolScope::Global,
            description: None,
        }
    }
}
