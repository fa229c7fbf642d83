//! The storage core as one shareable object.
//!
//! [`Store`] owns the connection pool and wires every component to it. It is
//! `Send + Sync`; share it behind an `Arc`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_settings::ParleySettings;
use rusqlite::Connection;
use tracing::{info, instrument};

use crate::backup::{BackupEntry, BackupManager, BackupRecord};
use crate::codec::CompressionCodec;
use crate::errors::Result;
use crate::health::{HealthMonitor, HealthReport};
use crate::maintenance::{MaintenanceRun, MaintenanceScheduler, MaintenanceTarget, PurgeReport, tasks};
use crate::schema::{InitReport, SchemaManager};
use crate::sqlite::{AccessMode, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::stats::{StatsCollector, StoreStats};

/// Embedded chat store.
#[derive(Debug)]
pub struct Store {
    pool: ConnectionPool,
    codec: CompressionCodec,
    schema: SchemaManager,
    backups: BackupManager,
    health: HealthMonitor,
    stats: StatsCollector,
    scheduler: MaintenanceScheduler,
    temp_dir: PathBuf,
}

impl Store {
    /// Build a store from settings.
    ///
    /// Opens no connection yet; call [`Store::initialize`] before use.
    pub fn open(settings: &ParleySettings) -> Result<Self> {
        let pool = ConnectionPool::open(ConnectionConfig::from_settings(settings))?;
        let codec = CompressionCodec::from_settings(&settings.compression);
        info!(path = %pool.path().display(), "store opened");
        Ok(Self {
            schema: SchemaManager::new(pool.clone(), settings.seed.clone()),
            backups: BackupManager::new(pool.clone(), codec.clone(), settings.backup_dir()),
            health: HealthMonitor::new(pool.clone(), settings.storage.max_open_write_transactions),
            stats: StatsCollector::new(pool.clone()),
            scheduler: MaintenanceScheduler::new(settings.maintenance.clone()),
            temp_dir: settings.temp_dir(),
            codec,
            pool,
        })
    }

    /// Store file.
    pub fn path(&self) -> &Path {
        self.pool.path()
    }

    /// Underlying pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Lease a connection. See [`ConnectionPool::acquire`].
    pub fn acquire(&self, mode: AccessMode) -> Result<PooledConnection> {
        self.pool.acquire(mode)
    }

    /// Run `f` in a write transaction. See [`ConnectionPool::with_transaction`].
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.pool.with_transaction(f)
    }

    /// Codec for large text values.
    pub fn codec(&self) -> &CompressionCodec {
        &self.codec
    }

    /// Create, seed and verify the schema. Call once at startup.
    #[instrument(skip(self), fields(path = %self.path().display()))]
    pub fn initialize(&self) -> Result<InitReport> {
        self.schema.initialize()
    }

    /// Persisted schema version.
    pub fn get_version(&self) -> Result<u32> {
        self.schema.get_version()
    }

    /// Raise the persisted schema version.
    pub fn set_version(&self, version: u32) -> Result<()> {
        self.schema.set_version(version)
    }

    /// Write the schema definition as SQL to `path`.
    pub fn export_schema(&self, path: &Path) -> Result<usize> {
        self.schema.export_schema(path)
    }

    /// Point-in-time backup.
    #[instrument(skip(self))]
    pub fn backup(&self, compress: bool) -> Result<BackupRecord> {
        self.backups.backup(compress)
    }

    /// Replace the live store with the backup at `source`.
    #[instrument(skip_all, fields(source = %source.display()))]
    pub fn restore(&self, source: &Path) -> Result<()> {
        self.backups.restore(source)
    }

    /// Backups on disk, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        self.backups.list_backups()
    }

    /// Delete all but the newest `keep` backups.
    pub fn prune_backups(&self, keep: usize) -> Result<usize> {
        self.backups.prune_backups(keep)
    }

    /// Diagnose the store. Never fails.
    pub fn check_health(&self) -> HealthReport {
        self.health.check_health()
    }

    /// Usage statistics.
    pub fn snapshot(&self) -> Result<StoreStats> {
        self.stats.snapshot()
    }

    /// Reclaim space; `aggressive` rebuilds the whole file.
    #[instrument(skip(self))]
    pub fn optimize(&self, aggressive: bool) -> Result<()> {
        tasks::optimize(&self.pool, aggressive)
    }

    /// Delete audit and edit-history rows older than `retention_days`.
    pub fn purge_expired(&self, retention_days: u32) -> Result<PurgeReport> {
        tasks::purge_expired(&self.pool, retention_days)
    }

    /// Delete leftover staging files older than `max_age`.
    pub fn remove_orphaned_temp_files(&self, max_age: Duration) -> Result<usize> {
        tasks::remove_orphaned_temp_files(&self.temp_dir, self.backups.backup_dir(), max_age)
    }

    /// One full maintenance run with the configured parameters.
    #[instrument(skip(self))]
    pub fn run_maintenance(&self) -> Result<MaintenanceRun> {
        self.scheduler.run(self)
    }
}

impl MaintenanceTarget for Store {
    fn store_path(&self) -> &Path {
        self.path()
    }

    fn purge_expired(&self, retention_days: u32) -> Result<PurgeReport> {
        Store::purge_expired(self, retention_days)
    }

    fn remove_orphaned_temp_files(&self, max_age: Duration) -> Result<usize> {
        Store::remove_orphaned_temp_files(self, max_age)
    }

    fn optimize(&self, aggressive: bool) -> Result<()> {
        Store::optimize(self, aggressive)
    }

    fn backup(&self, compress: bool) -> Result<BackupRecord> {
        Store::backup(self, compress)
    }

    fn prune_backups(&self, keep: usize) -> Result<usize> {
        Store::prune_backups(self, keep)
    }

    fn check_health(&self) -> HealthReport {
        Store::check_health(self)
    }

    fn snapshot(&self) -> Result<StoreStats> {
        Store::snapshot(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn store_is_shareable() {
        assert_send_sync::<Store>();
    }

    #[test]
    fn open_initialize_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&ParleySettings::rooted_at(dir.path())).unwrap();
        assert_eq!(store.path(), dir.path().join("parley.db"));

        let report = store.initialize().unwrap();
        assert_eq!(report.version, store.get_version().unwrap());
        assert_eq!(store.check_health().status, HealthStatus::Healthy);
        assert_eq!(store.snapshot().unwrap().tables["feature_flags"], 5);
    }

    #[test]
    fn temp_cleanup_uses_configured_directories() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ParleySettings::rooted_at(dir.path());
        let store = Store::open(&settings).unwrap();
        std::fs::create_dir_all(settings.temp_dir()).unwrap();
        std::fs::write(settings.temp_dir().join("export.json"), b"{}").unwrap();

        assert_eq!(store.remove_orphaned_temp_files(Duration::ZERO).unwrap(), 1);
    }
}
