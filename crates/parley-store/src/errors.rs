//! Error types for the storage core.
//!
//! [`StoreError`] is returned by every fallible storage operation. Health
//! findings are not errors: they are reported through
//! [`HealthReport`](crate::health::HealthReport).

use std::path::PathBuf;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store file could not be opened or a read handle could not be
    /// established. A checkout that only waited on busy readers is a
    /// [`StoreError::LockTimeout`] instead.
    #[error("connection error: {message}")]
    Connection {
        /// What failed and where.
        message: String,
    },

    /// A bounded wait for a lock expired.
    #[error("timed out after {waited_ms}ms waiting for the {resource}")]
    LockTimeout {
        /// The lock that was contended.
        resource: &'static str,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The calling thread already holds its write connection.
    #[error("the write connection of this thread is already leased")]
    WriterLeased,

    /// A transaction was begun, committed or rolled back out of order.
    #[error("transaction state error: {0}")]
    TransactionState(String),

    /// Tables expected after initialization are absent.
    #[error("schema verification failed, missing tables: {}", .missing.join(", "))]
    SchemaVerification {
        /// Names of the absent tables.
        missing: Vec<String>,
    },

    /// The store was written by a newer version of the code.
    #[error("store schema version {found} is newer than supported version {supported}")]
    IncompatibleSchema {
        /// Version recorded in the store.
        found: u32,
        /// Highest version this build understands.
        supported: u32,
    },

    /// An attempt to lower the persisted schema version.
    #[error("schema version cannot decrease from {current} to {requested}")]
    VersionRegression {
        /// Version recorded in the store.
        current: u32,
        /// Version the caller asked for.
        requested: u32,
    },

    /// A backup attempt failed; no file was left at the final path.
    #[error("backup failed: {message}")]
    Backup {
        /// Underlying cause.
        message: String,
    },

    /// A restore attempt failed; the live store was preserved.
    #[error("restore failed: {0}")]
    Restore(RestoreFailure),

    /// A best-effort maintenance step failed.
    #[error("maintenance step '{step}' failed: {message}")]
    MaintenanceStep {
        /// Name of the step.
        step: &'static str,
        /// Underlying cause.
        message: String,
    },

    /// A value could not be compressed or decompressed.
    #[error("codec error: {0}")]
    Codec(String),

    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a restore was refused or undone.
#[derive(Debug, Error)]
pub enum RestoreFailure {
    /// The source file does not exist.
    #[error("source {} does not exist", .0.display())]
    MissingSource(PathBuf),

    /// The source was written by an unknown or newer schema.
    #[error("source schema version {found} is incompatible (supported: 1..={supported})")]
    IncompatibleVersion {
        /// Version recorded in the source.
        found: u32,
        /// Highest version this build understands.
        supported: u32,
    },

    /// The source failed its integrity check before anything was replaced.
    #[error("source failed integrity check: {0}")]
    CorruptSource(String),

    /// The restored store failed its integrity check and was rolled back.
    #[error("restored store failed integrity check, previous store kept: {0}")]
    IntegrityCheck(String),

    /// Exclusive access could not be obtained in time.
    #[error("store busy, exclusive access not obtained within {0}ms")]
    Busy(u64),

    /// The engine or the filesystem failed while copying.
    #[error("{0}")]
    Copy(String),
}

/// Convenience type alias for storage results.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Whether this error means the store itself is unusable.
    ///
    /// Maintenance runs abort on fatal errors and log-and-continue on the
    /// rest.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::SchemaVerification { .. } => true,
            Self::Sqlite(err) => matches!(
                err.sqlite_error_code(),
                Some(
                    ErrorCode::DatabaseCorrupt
                        | ErrorCode::NotADatabase
                        | ErrorCode::CannotOpen
                        | ErrorCode::SystemIoFailure
                )
            ),
            _ => false,
        }
    }

    /// Map busy/locked engine errors to [`StoreError::LockTimeout`].
    pub(crate) fn from_contended(err: rusqlite::Error, resource: &'static str, waited_ms: u64) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::LockTimeout { resource, waited_ms }
            }
            _ => Self::Sqlite(err),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        Self::Connection {
            message: format!("reader pool: {err}"),
        }
    }
}

impl From<RestoreFailure> for StoreError {
    fn from(failure: RestoreFailure) -> Self {
        Self::Restore(failure)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn schema_verification_lists_missing_tables() {
        let err = StoreError::SchemaVerification {
            missing: vec!["messages".into(), "audit_log".into()],
        };
        assert_eq!(
            err.to_string(),
            "schema verification failed, missing tables: messages, audit_log"
        );
    }

    #[test]
    fn restore_failure_display() {
        let err = StoreError::from(RestoreFailure::Busy(30_000));
        assert_eq!(
            err.to_string(),
            "restore failed: store busy, exclusive access not obtained within 30000ms"
        );
    }

    #[test]
    fn lock_timeout_display() {
        let err = StoreError::LockTimeout {
            resource: "write gate",
            waited_ms: 250,
        };
        assert_eq!(err.to_string(), "timed out after 250ms waiting for the write gate");
    }

    #[test]
    fn connection_and_schema_errors_are_fatal() {
        assert!(
            StoreError::Connection {
                message: "cannot open".into()
            }
            .is_fatal()
        );
        assert!(StoreError::SchemaVerification { missing: vec![] }.is_fatal());
    }

    #[test]
    fn corruption_is_fatal() {
        let err = StoreError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT));
        assert!(err.is_fatal());
        let err = StoreError::Sqlite(sqlite_failure(rusqlite::ffi::SQLITE_NOTADB));
        assert!(err.is_fatal());
    }

    #[test]
    fn step_failures_are_not_fatal() {
        assert!(!StoreError::Backup { message: "disk full".into() }.is_fatal());
        assert!(
            !StoreError::LockTimeout {
                resource: "write gate",
                waited_ms: 10
            }
            .is_fatal()
        );
        assert!(!StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_fatal());
    }

    #[test]
    fn busy_maps_to_lock_timeout() {
        let err = StoreError::from_contended(
            sqlite_failure(rusqlite::ffi::SQLITE_BUSY),
            "write lock",
            5000,
        );
        assert!(matches!(
            err,
            StoreError::LockTimeout {
                resource: "write lock",
                waited_ms: 5000
            }
        ));
    }

    #[test]
    fn other_errors_pass_through_contention_mapping() {
        let err = StoreError::from_contended(
            sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT),
            "write lock",
            5000,
        );
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
