//! # parley-store
//!
//! Embedded `SQLite` storage core for the Parley chat backend.
//!
//! - [`ConnectionPool`]: pooled read-only handles plus one write handle per
//!   thread, tuned for write-ahead logging
//! - [`TransactionScope`]: `BEGIN IMMEDIATE` scopes that roll back on drop
//! - [`SchemaManager`]: idempotent schema creation, seeding and versioning
//! - [`BackupManager`]: online backups (optionally gzip) and verified restore
//! - [`HealthMonitor`] and [`StatsCollector`]: read-only diagnostics
//! - [`MaintenanceScheduler`]: retention, cleanup, optimize and backup runs
//! - [`CompressionCodec`]: threshold-based compression of large values
//!
//! [`Store`] wires all of them to one pool.

#![deny(unsafe_code)]

pub mod backup;
pub mod codec;
pub mod errors;
pub mod health;
pub mod maintenance;
pub mod schema;
pub mod sqlite;
pub mod stats;
pub mod store;

pub use backup::{BackupEntry, BackupManager, BackupRecord, BackupStatus};
pub use codec::{CompressedValue, CompressionCodec};
pub use errors::{RestoreFailure, Result, StoreError};
pub use health::{HealthCheck, HealthMonitor, HealthReport, HealthStatus};
pub use maintenance::{
    MaintenanceRun, MaintenanceScheduler, MaintenanceTarget, PurgeReport, StepOutcome, StepRecord,
};
pub use schema::{InitReport, SCHEMA_VERSION, SchemaManager, SeedOutcome, TABLES};
pub use sqlite::{AccessMode, ConnectionConfig, ConnectionPool, PooledConnection, TransactionScope};
pub use stats::{ActivityWindow, StatsCollector, StoreStats};
pub use store::Store;
