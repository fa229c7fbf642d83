#![allow(missing_docs, unused_results)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use assert_matches::assert_matches;
use parley_settings::ParleySettings;
use parley_store::health::checks;
use parley_store::{AccessMode, HealthStatus, SCHEMA_VERSION, SeedOutcome, Store, StoreError, TABLES};

fn settings(dir: &Path) -> ParleySettings {
    let mut settings = ParleySettings::rooted_at(dir);
    settings.storage.acquire_timeout_ms = 500;
    settings
}

fn count(store: &Store, table: &str) -> i64 {
    let conn = store.acquire(AccessMode::ReadOnly).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[test]
fn initialize_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&settings(dir.path())).unwrap();

    let first = store.initialize().unwrap();
    assert_eq!(first.version, SCHEMA_VERSION);
    let counts: Vec<i64> = TABLES.iter().map(|t| count(&store, t)).collect();

    let second = store.initialize().unwrap();
    assert_eq!(second.version, SCHEMA_VERSION);
    assert_eq!(second.seeded, SeedOutcome::default());
    assert_eq!(TABLES.iter().map(|t| count(&store, t)).collect::<Vec<_>>(), counts);
}

#[test]
fn initialize_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Store::open(&settings(dir.path())).unwrap();
        store.initialize().unwrap();
        store
            .with_transaction(|conn| {
                conn.execute("INSERT INTO audit_log (action, created_at) VALUES ('kept', 1)", [])?;
                Ok(())
            })
            .unwrap();
    }
    let store = Store::open(&settings(dir.path())).unwrap();
    store.initialize().unwrap();
    assert_eq!(count(&store, "audit_log"), 1);
}

#[test]
fn admin_is_seeded_only_into_an_empty_user_table() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&settings(dir.path())).unwrap();

    let report = store.initialize().unwrap();
    assert!(!report.seeded.admin_created);
    assert!(report.seeded.ai_models > 0);
    assert_eq!(count(&store, "users"), 0);

    store
        .with_transaction(|conn| {
            conn.execute(
                "INSERT INTO users (username, password_hash, created_at, updated_at) VALUES ('alice', 'x', 0, 0)",
                [],
            )?;
            Ok(())
        })
        .unwrap();
    drop(store);

    let mut with_admin = settings(dir.path());
    with_admin.seed.admin_username = Some("admin".into());
    with_admin.seed.admin_password = Some("hunter22".into());
    let store = Store::open(&with_admin).unwrap();
    let report = store.initialize().unwrap();
    assert!(!report.seeded.admin_created);
    assert_eq!(report.seeded.ai_models, 0);
    assert_eq!(count(&store, "users"), 1);
}

#[test]
fn version_only_moves_forward() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&settings(dir.path())).unwrap();
    store.initialize().unwrap();
    store.set_version(SCHEMA_VERSION).unwrap();
    assert_eq!(store.get_version().unwrap(), SCHEMA_VERSION);

    store.set_version(SCHEMA_VERSION + 1).unwrap();
    assert_matches!(
        store.set_version(SCHEMA_VERSION),
        Err(StoreError::VersionRegression { current, requested }) if current == SCHEMA_VERSION + 1 && requested == SCHEMA_VERSION
    );
    assert_matches!(store.initialize(), Err(StoreError::IncompatibleSchema { .. }));
}

#[test]
fn export_schema_lists_every_table() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&settings(dir.path())).unwrap();
    store.initialize().unwrap();

    let out = dir.path().join("export/schema.sql");
    let statements = store.export_schema(&out).unwrap();
    assert!(statements >= TABLES.len());

    let script = std::fs::read_to_string(&out).unwrap();
    for table in TABLES {
        assert!(script.contains(&format!(" {table} (")), "{table} missing from export");
    }

    let replay = rusqlite::Connection::open_in_memory().unwrap();
    replay.execute_batch(&script).unwrap();
}

#[test]
fn fresh_store_is_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&settings(dir.path())).unwrap();
    store.initialize().unwrap();
    let report = store.check_health();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.checks.iter().all(|c| c.passed));
}

#[test]
fn rollback_journal_is_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    {
        let store = Store::open(&settings).unwrap();
        store.initialize().unwrap();
    }
    {
        let raw = rusqlite::Connection::open(settings.db_path()).unwrap();
        let mode: String = raw.query_row("PRAGMA journal_mode = DELETE", [], |r| r.get(0)).unwrap();
        assert_eq!(mode, "delete");
    }

    let store = Store::open(&settings).unwrap();
    let report = store.check_health();
    assert_eq!(report.status, HealthStatus::Degraded);
    assert!(!report.check(checks::JOURNAL_MODE).unwrap().passed);
}

#[test]
fn damaged_pages_are_unhealthy() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    {
        let store = Store::open(&settings).unwrap();
        store.initialize().unwrap();
        store
            .with_transaction(|conn| {
                for i in 0..200 {
                    conn.execute(
                        "INSERT INTO audit_log (action, detail, created_at) VALUES ('fill', ?1, ?2)",
                        rusqlite::params!["x".repeat(200), i],
                    )?;
                }
                Ok(())
            })
            .unwrap();
        store.optimize(true).unwrap();
    }

    let db = settings.db_path();
    for suffix in ["-wal", "-shm"] {
        let mut side = db.clone().into_os_string();
        side.push(suffix);
        let _ = std::fs::remove_file(side);
    }
    let len = std::fs::metadata(&db).unwrap().len();
    let end = len.min(4096 * 8);
    assert!(end > 4096);
    let mut file = OpenOptions::new().write(true).open(&db).unwrap();
    file.seek(SeekFrom::Start(4096)).unwrap();
    file.write_all(&vec![0xA5; (end - 4096) as usize]).unwrap();
    file.sync_all().unwrap();
    drop(file);

    let store = Store::open(&settings).unwrap();
    let report = store.check_health();
    assert_eq!(report.status, HealthStatus::Unhealthy);
    // Damage that reaches the schema pages already fails the reader check.
    let unreachable = !report.check(checks::REACHABILITY).unwrap().passed;
    let damaged = report.check(checks::INTEGRITY).is_some_and(|check| !check.passed);
    assert!(unreachable || damaged);
}
