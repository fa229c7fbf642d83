//! Structural and referential health diagnostics.
//!
//! [`HealthMonitor::check_health`] never fails and never writes: findings,
//! including an unreachable store, are reported in the [`HealthReport`].

use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::sqlite::{AccessMode, ConnectionPool};

/// Overall classification of a health check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every check passed.
    Healthy,
    /// Usable, but not running as configured.
    Degraded,
    /// Unreachable, structurally damaged or referentially inconsistent.
    Unhealthy,
}

/// One named check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Check name.
    pub name: &'static str,
    /// Whether the check passed.
    pub passed: bool,
    /// What was observed.
    pub detail: String,
}

impl HealthCheck {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Result of one health check run. Built fresh each time, never persisted.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Classification.
    pub status: HealthStatus,
    /// Checks in the order they ran.
    pub checks: Vec<HealthCheck>,
    /// When the run started.
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Look up a check by name.
    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Check names, in run order.
pub mod checks {
    /// A trivial read succeeds.
    pub const REACHABILITY: &str = "reachability";
    /// `PRAGMA integrity_check` reports `ok`.
    pub const INTEGRITY: &str = "integrity";
    /// `PRAGMA foreign_key_check` reports no violations.
    pub const FOREIGN_KEYS: &str = "foreign_keys";
    /// The journal is in write-ahead-logging mode.
    pub const JOURNAL_MODE: &str = "journal_mode";
    /// Open write transactions are within the configured limit.
    pub const WRITE_TRANSACTIONS: &str = "write_transactions";
}

/// Runs health checks on pooled read-only connections.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    pool: ConnectionPool,
    max_open_write_transactions: usize,
}

impl HealthMonitor {
    /// Create a monitor. More than `max_open_write_transactions` concurrent
    /// write transactions report the store as degraded.
    pub fn new(pool: ConnectionPool, max_open_write_transactions: usize) -> Self {
        Self {
            pool,
            max_open_write_transactions,
        }
    }

    /// Run every check and classify the store.
    pub fn check_health(&self) -> HealthReport {
        let started = Instant::now();
        let checked_at = Utc::now();
        let mut report = HealthReport {
            status: HealthStatus::Healthy,
            checks: Vec::with_capacity(5),
            checked_at,
        };

        match self.pool.acquire(AccessMode::ReadOnly) {
            Ok(conn) => match conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)) {
                Ok(_) => {
                    report.checks.push(HealthCheck::pass(checks::REACHABILITY, "store answered"));
                    report.checks.push(integrity_check(&conn));
                    report.checks.push(foreign_key_check(&conn));
                    report.checks.push(journal_mode_check(&conn));
                }
                Err(e) => report
                    .checks
                    .push(HealthCheck::fail(checks::REACHABILITY, e.to_string())),
            },
            Err(e) => report
                .checks
                .push(HealthCheck::fail(checks::REACHABILITY, e.to_string())),
        }

        let open = self.pool.open_write_transactions();
        let detail = format!("{open} open (limit {})", self.max_open_write_transactions);
        report.checks.push(if open <= self.max_open_write_transactions {
            HealthCheck::pass(checks::WRITE_TRANSACTIONS, detail)
        } else {
            HealthCheck::fail(checks::WRITE_TRANSACTIONS, detail)
        });

        report.status = classify(&report.checks);
        let duration_ms = started.elapsed().as_millis() as u64;
        if report.status == HealthStatus::Healthy {
            info!(duration_ms, "store healthy");
        } else {
            let failed: Vec<&str> = report.checks.iter().filter(|c| !c.passed).map(|c| c.name).collect();
            warn!(
                operation = "check_health",
                duration_ms,
                path = %self.pool.path().display(),
                status = ?report.status,
                failed = ?failed,
                "store not healthy"
            );
        }
        report
    }
}

/// First match wins: unreachable or structural/referential failure is
/// unhealthy; a wrong journal mode or too many open writers is degraded.
fn classify(results: &[HealthCheck]) -> HealthStatus {
    let failed = |name: &str| results.iter().any(|c| c.name == name && !c.passed);
    let ran = |name: &str| results.iter().any(|c| c.name == name);

    if !ran(checks::REACHABILITY)
        || failed(checks::REACHABILITY)
        || failed(checks::INTEGRITY)
        || failed(checks::FOREIGN_KEYS)
    {
        HealthStatus::Unhealthy
    } else if failed(checks::JOURNAL_MODE) || failed(checks::WRITE_TRANSACTIONS) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Rows of `PRAGMA integrity_check` other than `ok`.
pub(crate) fn integrity_errors(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows.into_iter().filter(|row| row != "ok").collect())
}

fn integrity_check(conn: &Connection) -> HealthCheck {
    match integrity_errors(conn) {
        Ok(errors) if errors.is_empty() => HealthCheck::pass(checks::INTEGRITY, "ok"),
        Ok(errors) => HealthCheck::fail(checks::INTEGRITY, errors.join("; ")),
        Err(e) => HealthCheck::fail(checks::INTEGRITY, e.to_string()),
    }
}

fn foreign_key_check(conn: &Connection) -> HealthCheck {
    let violations = conn.prepare("PRAGMA foreign_key_check").and_then(|mut stmt| {
        stmt.query_map([], |row| {
            let table: String = row.get(0)?;
            let rowid: Option<i64> = row.get(1)?;
            let parent: String = row.get(2)?;
            Ok(format!("{table}#{} -> {parent}", rowid.unwrap_or_default()))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
    });
    match violations {
        Ok(v) if v.is_empty() => HealthCheck::pass(checks::FOREIGN_KEYS, "no violations"),
        Ok(v) => HealthCheck::fail(checks::FOREIGN_KEYS, format!("{} violation(s): {}", v.len(), v.join(", "))),
        Err(e) => HealthCheck::fail(checks::FOREIGN_KEYS, e.to_string()),
    }
}

fn journal_mode_check(conn: &Connection) -> HealthCheck {
    match conn.query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0)) {
        Ok(mode) if mode.eq_ignore_ascii_case("wal") => HealthCheck::pass(checks::JOURNAL_MODE, "wal"),
        Ok(mode) => HealthCheck::fail(checks::JOURNAL_MODE, format!("{mode} (expected wal)")),
        Err(e) => HealthCheck::fail(checks::JOURNAL_MODE, e.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
