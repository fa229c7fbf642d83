//! Schema lifecycle: creation, seeding, verification and versioning.
//!
//! The schema SQL is embedded at compile time via [`include_str!`] and is
//! fully idempotent (`IF NOT EXISTS`), so [`SchemaManager::initialize`] can
//! run on every process start. The `schema_version` table records each
//! version as it is reached; the current version is its maximum and never
//! decreases.

pub mod seed;

use std::io::Write;
use std::path::Path;
use std::time::Instant;

use parley_settings::SeedSettings;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{error, info};

use crate::errors::{Result, StoreError};
use crate::sqlite::{AccessMode, ConnectionPool};

pub use seed::{SeedOutcome, hash_password, verify_password};

/// Highest schema version this build creates and understands.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = include_str!("v001_schema.sql");

/// Every table a verified store contains.
pub const TABLES: &[&str] = &[
    "users",
    "ai_models",
    "conversations",
    "messages",
    "message_history",
    "feature_flags",
    "audit_log",
    "schema_version",
];

/// Result of [`SchemaManager::initialize`].
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    /// Schema version after initialization.
    pub version: u32,
    /// Rows created by seeding.
    pub seeded: SeedOutcome,
}

/// Creates, seeds, verifies and versions the store schema.
#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: ConnectionPool,
    seed: SeedSettings,
}

impl SchemaManager {
    /// Create a manager over `pool`.
    pub fn new(pool: ConnectionPool, seed: SeedSettings) -> Self {
        Self { pool, seed }
    }

    /// Create every table and index that is missing, seed empty reference
    /// tables and verify the result.
    ///
    /// Never drops or rewrites existing tables. Fails with
    /// [`StoreError::IncompatibleSchema`] when the store was written by a newer
    /// build and with [`StoreError::SchemaVerification`] when a table is still
    /// missing afterwards; both are fatal.
    pub fn initialize(&self) -> Result<InitReport> {
        let started = Instant::now();
        let result = self.initialize_inner();
        if let Err(e) = &result {
            error!(
                operation = "initialize",
                duration_ms = started.elapsed().as_millis() as u64,
                path = %self.pool.path().display(),
                error = %e,
                "schema initialization failed"
            );
        }
        result
    }

    fn initialize_inner(&self) -> Result<InitReport> {
        let conn = self.pool.acquire(AccessMode::ReadWrite)?;
        ensure_version_table(&conn)?;

        let found = current_version(&conn)?;
        if found > SCHEMA_VERSION {
            return Err(StoreError::IncompatibleSchema {
                found,
                supported: SCHEMA_VERSION,
            });
        }

        let tx = conn.begin()?;
        tx.execute_batch(SCHEMA_SQL)?;
        if found < SCHEMA_VERSION {
            record_version(&tx, SCHEMA_VERSION, "initial schema")?;
        }
        let seeded = seed::seed_defaults(&tx, &self.seed)?;
        tx.commit()?;

        verify(&conn)?;
        let version = current_version(&conn)?;
        info!(version, ?seeded, "schema initialized");
        Ok(InitReport { version, seeded })
    }

    /// Persisted schema version, or 0 for a store never initialized.
    pub fn get_version(&self) -> Result<u32> {
        let conn = self.pool.acquire(AccessMode::ReadOnly)?;
        if !table_exists(&conn, "schema_version")? {
            return Ok(0);
        }
        current_version(&conn)
    }

    /// Record `version` as the current schema version.
    ///
    /// Setting the current version again is a no-op; going backwards fails
    /// with [`StoreError::VersionRegression`].
    pub fn set_version(&self, version: u32) -> Result<()> {
        let conn = self.pool.acquire(AccessMode::ReadWrite)?;
        ensure_version_table(&conn)?;
        let tx = conn.begin()?;
        let current = current_version(&tx)?;
        if version < current {
            tx.rollback()?;
            return Err(StoreError::VersionRegression {
                current,
                requested: version,
            });
        }
        if version > current {
            record_version(&tx, version, "set by operator")?;
            info!(from = current, to = version, "schema version bumped");
        }
        tx.commit()
    }

    /// Names of expected tables that are absent from the store.
    pub fn missing_tables(&self) -> Result<Vec<String>> {
        let conn = self.pool.acquire(AccessMode::ReadOnly)?;
        missing_tables(&conn)
    }

    /// Write the definition of every user table, index and trigger to `path`
    /// as a SQL script. Returns the number of statements written.
    ///
    /// The file is written under a temporary name and renamed into place.
    pub fn export_schema(&self, path: &Path) -> Result<usize> {
        let conn = self.pool.acquire(AccessMode::ReadOnly)?;
        let version = if table_exists(&conn, "schema_version")? {
            current_version(&conn)?
        } else {
            0
        };
        let mut stmt = conn.prepare(
            "SELECT sql FROM sqlite_master
             WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
             ORDER BY CASE type WHEN 'table' THEN 0 WHEN 'index' THEN 1 ELSE 2 END, name",
        )?;
        let statements: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut script = format!("-- parley schema, version {version}\n\n");
        for sql in &statements {
            script.push_str(sql);
            script.push_str(";\n\n");
        }
        write_atomically(path, script.as_bytes())?;
        info!(path = %path.display(), statements = statements.len(), "schema exported");
        Ok(statements.len())
    }
}

/// Read the highest recorded version from an open connection.
pub(crate) fn current_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn missing_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for table in TABLES {
        if !table_exists(conn, table)? {
            missing.push((*table).to_string());
        }
    }
    Ok(missing)
}

fn verify(conn: &Connection) -> Result<()> {
    let missing = missing_tables(conn)?;
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::SchemaVerification { missing })
    }
}

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version     INTEGER PRIMARY KEY,
           applied_at  TEXT    NOT NULL,
           description TEXT
         );",
    )?;
    Ok(())
}

fn record_version(conn: &Connection, version: u32, description: &str) -> Result<()> {
    let _ = conn.execute(
        "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, datetime('now'), ?2)",
        params![version, description],
    )?;
    Ok(())
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::now_v7()));
    let written = std::fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(contents)?;
        file.sync_all()
    });
    match written.and_then(|()| std::fs::rename(&tmp, path)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e.into())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parley_logging::capture_logs;
    use tracing::Level;

    use crate::sqlite::ConnectionConfig;

    fn manager() -> (tempfile::TempDir, SchemaManager) {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(ConnectionConfig::for_path(dir.path().join("schema.db"))).unwrap();
        (dir, SchemaManager::new(pool, SeedSettings::default()))
    }

    #[test]
    fn initialize_creates_all_tables() {
        let (_dir, schema) = manager();
        let report = schema.initialize().unwrap();
        assert_eq!(report.version, SCHEMA_VERSION);
        assert!(schema.missing_tables().unwrap().is_empty());
    }

    #[test]
    fn initialize_twice_is_idempotent() {
        let (_dir, schema) = manager();
        let first = schema.initialize().unwrap();
        let second = schema.initialize().unwrap();
        assert_eq!(first.version, second.version);
        assert_eq!(second.seeded, SeedOutcome::default());

        let conn = schema.pool.acquire(AccessMode::ReadOnly).unwrap();
        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[test]
    fn version_of_fresh_store_is_zero() {
        let (_dir, schema) = manager();
        // Materialize an empty file without the version table.
        schema.pool.acquire(AccessMode::ReadWrite).unwrap();
        assert_eq!(schema.get_version().unwrap(), 0);
    }

    #[test]
    fn set_version_moves_forward_only() {
        let (_dir, schema) = manager();
        schema.initialize().unwrap();
        schema.set_version(3).unwrap();
        assert_eq!(schema.get_version().unwrap(), 3);

        schema.set_version(3).unwrap();
        assert_matches!(
            schema.set_version(2),
            Err(StoreError::VersionRegression { current: 3, requested: 2 })
        );
        assert_eq!(schema.get_version().unwrap(), 3);
        assert_eq!(schema.pool.open_write_transactions(), 0);
    }

    #[test]
    fn refused_version_change_is_not_reported_as_abandoned_transaction() {
        let (logs, _guard) = capture_logs();
        let (_dir, schema) = manager();
        schema.initialize().unwrap();
        schema.set_version(3).unwrap();
        logs.clear();

        assert_matches!(schema.set_version(1), Err(StoreError::VersionRegression { .. }));
        assert!(logs.at_least(Level::WARN).is_empty());
        assert_eq!(schema.pool.open_write_transactions(), 0);
    }

    #[test]
    fn newer_store_is_refused() {
        let (_dir, schema) = manager();
        schema.initialize().unwrap();
        schema.set_version(SCHEMA_VERSION + 1).unwrap();
        assert_matches!(
            schema.initialize(),
            Err(StoreError::IncompatibleSchema { supported: SCHEMA_VERSION, .. })
        );
    }

    #[test]
    fn initialize_keeps_existing_rows() {
        let (_dir, schema) = manager();
        schema.initialize().unwrap();
        schema
            .pool
            .acquire(AccessMode::ReadWrite)
            .unwrap()
            .execute(
                "INSERT INTO audit_log (action, created_at) VALUES ('login', 1)",
                [],
            )
            .unwrap();
        schema.initialize().unwrap();
        let conn = schema.pool.acquire(AccessMode::ReadOnly).unwrap();
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn missing_table_fails_verification() {
        let (_dir, schema) = manager();
        schema.initialize().unwrap();
        {
            let conn = schema.pool.acquire(AccessMode::ReadWrite).unwrap();
            conn.execute_batch("DROP TABLE feature_flags").unwrap();
        }
        assert_eq!(schema.missing_tables().unwrap(), vec!["feature_flags".to_string()]);

        let conn = schema.pool.acquire(AccessMode::ReadOnly).unwrap();
        assert_matches!(verify(&conn), Err(StoreError::SchemaVerification { missing }) if missing == ["feature_flags"]);
    }

    #[test]
    fn export_rebuilds_structure_without_data() {
        let (dir, schema) = manager();
        schema.initialize().unwrap();
        let out = dir.path().join("export/schema.sql");
        let statements = schema.export_schema(&out).unwrap();
        assert!(statements >= TABLES.len());

        let script = std::fs::read_to_string(&out).unwrap();
        assert!(!script.contains("sqlite_autoindex"));
        assert!(!script.contains("INSERT"));

        let rebuilt = Connection::open_in_memory().unwrap();
        rebuilt.execute_batch(&script).unwrap();
        assert!(missing_tables(&rebuilt).unwrap().is_empty());
        let models: i64 = rebuilt.query_row("SELECT COUNT(*) FROM ai_models", [], |r| r.get(0)).unwrap();
        assert_eq!(models, 0);
    }
}
