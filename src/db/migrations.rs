//! Forward-only, versioned schema migrations.
//!
//! Applied versions are recorded in `schema_migrations`. On every open the
//! runner applies each listed migration whose version is not recorded yet, in
//! ascending order, one transaction per migration. Migrations that need a
//! capability the connection lacks are skipped without being recorded, so a
//! later open that has the capability picks them up.

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeSet;

use super::schema;
use super::Capabilities;
use crate::error::{Error, Result};

/// Optional features a migration can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// sqlite-vec loaded on this connection.
    Vector,
}

/// What a migration does when applied.
#[derive(Clone, Copy)]
pub enum MigrationAction {
    /// A batch of SQL statements.
    Statements(&'static str),
    /// Arbitrary code against the live connection, for steps that branch on
    /// the current schema.
    Procedure(fn(&Connection) -> rusqlite::Result<()>),
}

impl std::fmt::Debug for MigrationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Statements(_) => f.write_str("Statements(..)"),
            Self::Procedure(_) => f.write_str("Procedure(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub requires: Option<Capability>,
    pub action: MigrationAction,
}

/// Outcome of one `apply_pending` pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub applied: Vec<u32>,
    /// Pending versions skipped for a missing capability.
    pub skipped: Vec<u32>,
}

/// The full migration list. Versions must be strictly increasing; new
/// migrations are appended, never inserted.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core_tables",
        requires: None,
        action: MigrationAction::Statements(schema::CORE_TABLES_SQL),
    },
    Migration {
        version: 2,
        name: "observations_fts",
        requires: None,
        action: MigrationAction::Statements(schema::OBSERVATIONS_FTS_SQL),
    },
    Migration {
        version: 3,
        name: "threshold_history",
        requires: None,
        action: MigrationAction::Statements(schema::THRESHOLD_HISTORY_SQL),
    },
    Migration {
        version: 4,
        name: "tool_registry",
        requires: None,
        action: MigrationAction::Statements(schema::TOOL_REGISTRY_SQL),
    },
    Migration {
        version: 5,
        name: "registry_usage_columns",
        requires: None,
        action: MigrationAction::Procedure(schema::add_registry_usage_columns),
    },
    Migration {
        version: 6,
        name: "vector_indexes",
        requires: Some(Capability::Vector),
        action: MigrationAction::Procedure(schema::create_vector_indexes),
    },
    Migration {
        version: 7,
        name: "embedding_attempts",
        requires: None,
        action: MigrationAction::Procedure(schema::add_embedding_attempt_columns),
    },
];

const MIGRATIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
);";

/// Apply every pending migration from [`MIGRATIONS`].
pub fn apply_pending(conn: &Connection, capabilities: &Capabilities) -> Result<MigrationReport> {
    apply_migrations(conn, MIGRATIONS, capabilities)
}

/// Apply pending migrations from an explicit list.
pub fn apply_migrations(
    conn: &Connection,
    migrations: &[Migration],
    capabilities: &Capabilities,
) -> Result<MigrationReport> {
    if let Some(pair) = migrations.windows(2).find(|w| w[0].version >= w[1].version) {
        return Err(Error::InvalidInput(format!(
            "migration versions must be strictly increasing (v{} before v{})",
            pair[0].version, pair[1].version
        )));
    }

    conn.execute_batch(MIGRATIONS_TABLE_SQL)?;
    let applied = applied_versions(conn)?;
    tracing::debug!(
        max_applied = applied.last().copied().unwrap_or(0),
        known = migrations.len(),
        "checking migrations"
    );

    let mut report = MigrationReport::default();
    for migration in migrations {
        if applied.contains(&migration.version) {
            continue;
        }
        if let Some(required) = migration.requires {
            if !capabilities.has(required) {
                tracing::debug!(
                    version = migration.version,
                    name = migration.name,
                    capability = ?required,
                    "skipping migration, capability unavailable"
                );
                report.skipped.push(migration.version);
                continue;
            }
        }

        tracing::info!(version = migration.version, name = migration.name, "running migration");
        apply_one(conn, migration).map_err(|source| Error::Migration {
            version: migration.version,
            name: migration.name,
            source,
        })?;
        report.applied.push(migration.version);
    }

    Ok(report)
}

fn apply_one(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    // Another process may have applied it while we waited for the lock.
    let already: Option<u32> = tx
        .query_row(
            "SELECT version FROM schema_migrations WHERE version = ?1",
            [migration.version],
            |row| row.get(0),
        )
        .optional()?;
    if already.is_some() {
        return tx.commit();
    }

    match migration.action {
        MigrationAction::Statements(sql) => tx.execute_batch(sql)?,
        MigrationAction::Procedure(procedure) => procedure(&tx)?,
    }

    tx.execute(
        "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![migration.version, migration.name, crate::memory::now_timestamp()],
    )?;
    tx.commit()
}

/// Versions recorded in `schema_migrations`, ascending.
pub fn applied_versions(conn: &Connection) -> Result<BTreeSet<u32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(versions)
}

/// Highest recorded version, or 0 for an empty store.
pub fn max_applied_version(conn: &Connection) -> Result<u32> {
    let version: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

/// Read a value from `schema_meta`.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM schema_meta WHERE key = ?1", [key], |row| {
            row.get::<_, String>(0)
        })
        .optional()?;
    Ok(value)
}

/// Write a value to `schema_meta`.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_meta (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}
