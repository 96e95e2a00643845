//! Schema migrations for the Steward store.
//!
//! Migrations are versioned, idempotent and forward-only. Applied versions are
//! recorded in `schema_migrations`; a single-row `migration_lock` table acts as
//! an advisory lock so two processes never migrate the same file at once.
//!
//! ```rust,ignore
//! use steward_core::migrations::run_migrations;
//!
//! let conn = steward_core::open_connection("steward.db")?;
//! steward_core::init_sqlite_schema(&conn)?;
//! run_migrations(&conn)?;
//! ```
//!
//! Run migrations from one actor (the CLI `migrate run` command or an init
//! job). Locks older than five minutes are treated as abandoned.

use crate::{Result, StewardError};
use rusqlite::Connection;

mod v1_1_0;
mod v1_2_0;
mod v1_3_0;

/// Migration version number: MAJOR * 1_000_000 + MINOR * 1_000 + PATCH.
pub type MigrationVersion = i64;

/// A schema migration.
pub struct Migration {
    /// Unique, monotonically increasing version
    pub version: MigrationVersion,
    /// Human-readable description
    pub description: &'static str,
    /// Idempotent SQL batch
    pub sql: &'static str,
    /// Columns to add after the batch as (table, column, type).
    /// SQLite has no `ADD COLUMN IF NOT EXISTS`, so these are checked first.
    pub add_columns: &'static [(&'static str, &'static str, &'static str)],
}

/// All migrations in application order. Append new ones at the end.
pub fn all_migrations() -> Vec<Migration> {
    vec![
        v1_1_0::migration(),
        v1_2_0::migration(),
        v1_3_0::migration(),
    ]
}

fn init_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS migration_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            locked_at TEXT,
            locked_by TEXT
        );

        INSERT OR IGNORE INTO migration_lock (id, locked_at, locked_by) VALUES (1, NULL, NULL);
        "#,
    )?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .any(|r| r.map(|name| name == column).unwrap_or(false));
    Ok(exists)
}

/// Add a column unless it is already present. Returns whether it was added.
fn add_column_if_not_exists(
    conn: &Connection,
    table: &str,
    column: &str,
    column_type: &str,
) -> Result<bool> {
    if column_exists(conn, table, column)? {
        tracing::debug!(table, column, "Column already exists, skipping");
        return Ok(false);
    }

    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type),
        [],
    )?;
    tracing::info!(table, column, column_type, "Added column");
    Ok(true)
}

/// Take the advisory lock. Returns false while another holder's lock is fresh.
fn acquire_migration_lock(conn: &Connection) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE migration_lock SET locked_at = datetime('now'), locked_by = 'steward'
         WHERE id = 1 AND (locked_at IS NULL OR locked_at < datetime('now', '-5 minutes'))",
        [],
    )?;
    Ok(rows > 0)
}

fn release_migration_lock(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE migration_lock SET locked_at = NULL, locked_by = NULL WHERE id = 1",
        [],
    )?;
    Ok(())
}

/// Highest applied migration version (0 for a fresh store).
pub fn get_schema_version(conn: &Connection) -> Result<MigrationVersion> {
    init_migrations_table(conn)?;

    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .ok()
        .flatten();

    Ok(version.unwrap_or(0))
}

pub fn is_migration_applied(conn: &Connection, version: MigrationVersion) -> Result<bool> {
    init_migrations_table(conn)?;

    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
        [version],
        |row| row.get(0),
    )?;

    Ok(count > 0)
}

/// Apply all pending migrations and return how many were applied.
///
/// Each migration runs in its own transaction. Fails with `Other` when the
/// advisory lock is held by someone else.
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    init_migrations_table(conn)?;

    if !acquire_migration_lock(conn)? {
        return Err(StewardError::Other(
            "Another migration is in progress. Wait and retry.".to_string(),
        ));
    }

    let result = apply_pending(conn);

    if let Err(e) = release_migration_lock(conn) {
        tracing::warn!(error = %e, "Failed to release migration lock");
    }

    result
}

fn apply_pending(conn: &Connection) -> Result<usize> {
    let mut pending = Vec::new();
    for migration in all_migrations() {
        if !is_migration_applied(conn, migration.version)? {
            pending.push(migration);
        }
    }

    if pending.is_empty() {
        tracing::debug!("Schema is up to date");
    }
    for migration in &pending {
        apply_migration(conn, migration)?;
    }
    Ok(pending.len())
}

/// Run one migration's batch and column additions, then record it, all in one
/// transaction. A failure leaves neither the schema change nor the history row.
fn apply_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    tracing::info!(
        version = migration.version,
        description = migration.description,
        "Applying migration"
    );
    let failed = |e: StewardError| {
        StewardError::Other(format!("Migration {} failed: {}", migration.version, e))
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(migration.sql).map_err(|e| failed(e.into()))?;
    for (table, column, col_type) in migration.add_columns {
        add_column_if_not_exists(&tx, table, column, col_type).map_err(failed)?;
    }
    tx.execute(
        "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, datetime('now'))",
        rusqlite::params![migration.version, migration.description],
    )?;
    tx.commit()?;
    Ok(())
}

/// Applied migrations as (version, description, applied_at).
pub fn get_migration_history(conn: &Connection) -> Result<Vec<(MigrationVersion, String, String)>> {
    init_migrations_table(conn)?;

    let mut stmt = conn.prepare(
        "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
    )?;

    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn needs_migration(conn: &Connection) -> Result<bool> {
    let current = get_schema_version(conn)?;
    let latest = all_migrations().last().map(|m| m.version).unwrap_or(0);
    Ok(current < latest)
}
