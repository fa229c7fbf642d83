#![allow(missing_docs, unused_results)]

use assert_matches::assert_matches;
use parley_settings::ParleySettings;
use parley_store::maintenance::steps;
use parley_store::sqlite::now_ms;
use parley_store::{AccessMode, StepOutcome, Store};
use rusqlite::params;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn audit_ages(store: &Store) -> Vec<i64> {
    let now = now_ms();
    let conn = store.acquire(AccessMode::ReadOnly).unwrap();
    let mut stmt = conn.prepare("SELECT created_at FROM audit_log ORDER BY created_at DESC").unwrap();
    stmt.query_map([], |r| r.get::<_, i64>(0))
        .unwrap()
        .map(|at| (now - at.unwrap()) / DAY_MS)
        .collect()
}

#[test]
fn maintenance_run_purges_old_audit_rows_and_backs_up() {
    let dir = tempfile::tempdir().unwrap();
    let settings = ParleySettings::rooted_at(dir.path());
    let store = Store::open(&settings).unwrap();
    store.initialize().unwrap();

    let now = now_ms();
    store
        .with_transaction(|conn| {
            for age_days in [0_i64, 30, 89, 91, 365] {
                conn.execute(
                    "INSERT INTO audit_log (action, created_at) VALUES ('login', ?1)",
                    params![now - age_days * DAY_MS - 1_000],
                )?;
            }
            Ok(())
        })
        .unwrap();

    let run = store.run_maintenance().unwrap();
    assert_eq!(run.failures(), 0, "{run:?}");
    assert_eq!(audit_ages(&store), [0, 30, 89]);

    assert_matches!(run.step(steps::BACKUP).unwrap().outcome, StepOutcome::Completed { .. });
    let backups = store.list_backups().unwrap();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].compressed);

    assert_eq!(
        run.step(steps::CHECK_HEALTH).unwrap().outcome,
        StepOutcome::Completed {
            detail: "healthy".into()
        }
    );
}

#[test]
fn retention_window_is_configurable() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = ParleySettings::rooted_at(dir.path());
    settings.maintenance.retention_days = 7;
    settings.maintenance.compress_backups = false;
    let store = Store::open(&settings).unwrap();
    store.initialize().unwrap();

    let now = now_ms();
    store
        .with_transaction(|conn| {
            for age_days in [1_i64, 8] {
                conn.execute(
                    "INSERT INTO audit_log (action, created_at) VALUES ('login', ?1)",
                    params![now - age_days * DAY_MS],
                )?;
            }
            Ok(())
        })
        .unwrap();

    store.run_maintenance().unwrap();
    assert_eq!(audit_ages(&store), [1]);
    assert!(!store.list_backups().unwrap()[0].compressed);
}

#[test]
fn repeated_runs_keep_bounded_backups() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = ParleySettings::rooted_at(dir.path());
    settings.maintenance.keep_backups = 2;
    let store = Store::open(&settings).unwrap();
    store.initialize().unwrap();

    for _ in 0..4 {
        store.run_maintenance().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(store.list_backups().unwrap().len(), 2);
}
