//! Individual maintenance steps.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::sqlite::{AccessMode, ConnectionPool, now_ms};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Rows removed by [`purge_expired`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    /// Rows older than this instant (Unix ms) were removed.
    pub cutoff_ms: i64,
    /// Audit log rows removed.
    pub audit_rows: usize,
    /// Message history rows removed.
    pub history_rows: usize,
}

/// Delete audit and edit-history rows older than `retention_days`.
pub fn purge_expired(pool: &ConnectionPool, retention_days: u32) -> Result<PurgeReport> {
    let cutoff_ms = now_ms() - i64::from(retention_days) * DAY_MS;
    let report = pool.with_transaction(|conn| {
        let audit_rows = conn.execute("DELETE FROM audit_log WHERE created_at < ?1", params![cutoff_ms])?;
        let history_rows = conn.execute("DELETE FROM message_history WHERE edited_at < ?1", params![cutoff_ms])?;
        Ok(PurgeReport {
            cutoff_ms,
            audit_rows,
            history_rows,
        })
    })?;
    info!(
        retention_days,
        audit_rows = report.audit_rows,
        history_rows = report.history_rows,
        "purged expired rows"
    );
    Ok(report)
}

/// Remove files older than `max_age` from `temp_dir`, and `*.partial`
/// leftovers older than `max_age` from `backup_dir`.
///
/// Missing directories count as empty. A file that cannot be removed is
/// logged and skipped.
pub fn remove_orphaned_temp_files(temp_dir: &Path, backup_dir: &Path, max_age: Duration) -> Result<usize> {
    let now = SystemTime::now();
    let temp = sweep(temp_dir, now, max_age, |_| true)?;
    let partial = sweep(backup_dir, now, max_age, |name| name.ends_with(".partial"))?;
    let removed = temp + partial;
    if removed > 0 {
        info!(removed, "removed orphaned temporary files");
    }
    Ok(removed)
}

fn sweep(dir: &Path, now: SystemTime, max_age: Duration, matches: impl Fn(&str) -> bool) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        if !path.file_name().and_then(|n| n.to_str()).is_some_and(&matches) {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), age_secs = age.as_secs(), "removed orphaned file");
                removed += 1;
            }
            Err(e) => warn!(
                operation = "remove_orphaned_temp_files",
                path = %path.display(),
                error = %e,
                "cannot remove orphaned file, skipping"
            ),
        }
    }
    Ok(removed)
}

/// Reclaim free pages and refresh planner statistics.
///
/// Standard mode is incremental and safe during traffic. Aggressive mode
/// pauses writers, rebuilds the whole file and truncates the write-ahead
/// log; it blocks for time proportional to the store size.
pub fn optimize(pool: &ConnectionPool, aggressive: bool) -> Result<()> {
    if aggressive {
        let _paused = pool.pause_writers(pool.config().exclusive_timeout)?;
        let conn = pool.acquire(AccessMode::ReadWrite)?;
        conn.execute_batch(
            "PRAGMA wal_checkpoint(TRUNCATE);\
             VACUUM;\
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        info!(path = %pool.path().display(), "full compaction complete");
    } else {
        let conn = pool.acquire(AccessMode::ReadWrite)?;
        drain(&conn, "PRAGMA incremental_vacuum")?;
        conn.execute_batch("PRAGMA optimize;")?;
        debug!("incremental optimize complete");
    }
    Ok(())
}

/// Step through a pragma that yields one row per unit of work.
fn drain(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
