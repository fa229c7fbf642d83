//! Scheduled maintenance runs.
//!
//! A run executes a fixed sequence of steps against a [`MaintenanceTarget`].
//! Each step is timed and isolated: a failure is logged, recorded, and the
//! run moves on. Only an error showing the store itself is unusable
//! ([`StoreError::is_fatal`]) aborts the run.

pub mod tasks;

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parley_settings::MaintenanceSettings;
use serde::Serialize;
use tracing::{error, info, warn};

pub use tasks::PurgeReport;

use crate::backup::BackupRecord;
use crate::errors::{Result, StoreError};
use crate::health::HealthReport;
use crate::stats::StoreStats;

/// Operations a maintenance run drives.
///
/// [`Store`](crate::Store) is the production implementation.
pub trait MaintenanceTarget {
    /// Store file, for log context.
    fn store_path(&self) -> &Path;

    /// Delete audit and history rows older than `retention_days`.
    fn purge_expired(&self, retention_days: u32) -> Result<PurgeReport>;

    /// Delete leftover temporary files older than `max_age`.
    fn remove_orphaned_temp_files(&self, max_age: Duration) -> Result<usize>;

    /// Reclaim space and refresh planner statistics.
    fn optimize(&self, aggressive: bool) -> Result<()>;

    /// Write a point-in-time backup.
    fn backup(&self, compress: bool) -> Result<BackupRecord>;

    /// Keep only the newest `keep` backups.
    fn prune_backups(&self, keep: usize) -> Result<usize>;

    /// Run diagnostics.
    fn check_health(&self) -> HealthReport;

    /// Collect statistics.
    fn snapshot(&self) -> Result<StoreStats>;
}

/// Step names, in run order.
pub mod steps {
    /// Retention purge of audit and edit history.
    pub const PURGE_EXPIRED: &str = "purge_expired";
    /// Orphaned temporary file cleanup.
    pub const REMOVE_TEMP_FILES: &str = "remove_temp_files";
    /// Space reclaim and statistics refresh.
    pub const OPTIMIZE: &str = "optimize";
    /// Compressed backup.
    pub const BACKUP: &str = "backup";
    /// Deletion of backups beyond the retention count.
    pub const PRUNE_BACKUPS: &str = "prune_backups";
    /// Health check.
    pub const CHECK_HEALTH: &str = "check_health";
    /// Statistics snapshot.
    pub const SNAPSHOT: &str = "snapshot";
}

/// How one step ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum StepOutcome {
    /// The step succeeded.
    Completed {
        /// Short summary of what it did.
        detail: String,
    },
    /// The step failed and was skipped.
    Failed {
        /// The error.
        error: String,
    },
}

/// One executed step.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Step name, one of [`steps`].
    pub name: &'static str,
    /// Result.
    pub outcome: StepOutcome,
    /// Wall-clock time spent.
    pub duration_ms: u64,
}

/// Record of a completed run. Logged, not persisted.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceRun {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Steps in execution order.
    pub steps: Vec<StepRecord>,
}

impl MaintenanceRun {
    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Number of failed steps.
    pub fn failures(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
            .count()
    }
}

/// Sequences the maintenance steps with the configured parameters.
#[derive(Clone, Debug)]
pub struct MaintenanceScheduler {
    settings: MaintenanceSettings,
}

impl MaintenanceScheduler {
    /// Create a scheduler.
    pub fn new(settings: MaintenanceSettings) -> Self {
        Self { settings }
    }

    /// Execute one run: purge, temp cleanup, optimize, backup, prune, then
    /// health and statistics.
    ///
    /// Returns `Err` only when a step fails with a fatal error; every other
    /// failure is recorded in the returned [`MaintenanceRun`].
    pub fn run(&self, target: &dyn MaintenanceTarget) -> Result<MaintenanceRun> {
        let started = Instant::now();
        let mut run = Run {
            target,
            record: MaintenanceRun {
                started_at: Utc::now(),
                steps: Vec::with_capacity(7),
            },
        };
        let s = &self.settings;

        run.step(steps::PURGE_EXPIRED, |t| {
            t.purge_expired(s.retention_days)
                .map(|r| format!("{} audit, {} history rows", r.audit_rows, r.history_rows))
        })?;
        run.step(steps::REMOVE_TEMP_FILES, |t| {
            let max_age = Duration::from_secs(s.temp_file_max_age_hours * 3600);
            t.remove_orphaned_temp_files(max_age).map(|n| format!("{n} files"))
        })?;
        run.step(steps::OPTIMIZE, |t| {
            t.optimize(s.aggressive_optimize)
                .map(|()| if s.aggressive_optimize { "full" } else { "incremental" }.to_owned())
        })?;
        run.step(steps::BACKUP, |t| {
            t.backup(s.compress_backups)
                .map(|r| format!("{} ({} bytes)", r.path.display(), r.size_bytes))
        })?;
        run.step(steps::PRUNE_BACKUPS, |t| {
            t.prune_backups(s.keep_backups).map(|n| format!("{n} pruned"))
        })?;
        run.step(steps::CHECK_HEALTH, |t| {
            let report = t.check_health();
            Ok(format!("{:?}", report.status).to_lowercase())
        })?;
        run.step(steps::SNAPSHOT, |t| {
            t.snapshot()
                .map(|stats| format!("{} bytes, {} free pages", stats.size_bytes, stats.freelist_count))
        })?;

        let record = run.record;
        info!(
            path = %target.store_path().display(),
            duration_ms = started.elapsed().as_millis() as u64,
            steps = record.steps.len(),
            failures = record.failures(),
            "maintenance run finished"
        );
        Ok(record)
    }
}

struct Run<'a> {
    target: &'a dyn MaintenanceTarget,
    record: MaintenanceRun,
}

impl Run<'_> {
    fn step<F>(&mut self, name: &'static str, f: F) -> Result<()>
    where
        F: FnOnce(&dyn MaintenanceTarget) -> Result<String>,
    {
        let started = Instant::now();
        let result = f(self.target);
        let duration_ms = started.elapsed().as_millis() as u64;
        let path = self.target.store_path().display();

        let outcome = match result {
            Ok(detail) => StepOutcome::Completed { detail },
            Err(e) if e.is_fatal() => {
                error!(operation = name, duration_ms, path = %path, error = %e, "maintenance aborted");
                return Err(e);
            }
            Err(e) => {
                let e = StoreError::MaintenanceStep {
                    step: name,
                    message: e.to_string(),
                };
                warn!(operation = name, duration_ms, path = %path, error = %e, "maintenance step failed, continuing");
                StepOutcome::Failed { error: e.to_string() }
            }
        };
        self.record.steps.push(StepRecord {
            name,
            outcome,
            duration_ms,
        });
        Ok(())
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { detail } => write!(f, "completed: {detail}"),
            Self::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
