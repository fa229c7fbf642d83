//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the keys it overrides.

mod maintenance;
mod storage;

pub use maintenance::*;
pub use storage::*;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "storage": { "dbPath": "/var/lib/parley/chat.db" },
///   "maintenance": { "retentionDays": 30 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// Store location, pool sizing and engine tuning.
    pub storage: StorageSettings,
    /// Large-value compression.
    pub compression: CompressionSettings,
    /// Retention and maintenance cadence parameters.
    pub maintenance: MaintenanceSettings,
    /// Reference data seeded by schema initialization.
    pub seed: SeedSettings,
}

impl ParleySettings {
    /// Settings rooted at `dir`: the store, backups and temp files all live
    /// underneath it. Used by tests and by `--data-dir` style overrides.
    pub fn rooted_at(dir: &Path) -> Self {
        let mut settings = Self::default();
        settings.storage.db_path = dir.join("parley.db").display().to_string();
        settings.storage.backup_dir = dir.join("backups").display().to_string();
        settings.storage.temp_dir = dir.join("tmp").display().to_string();
        settings
    }

    /// Absolute path of the store file.
    pub fn db_path(&self) -> PathBuf {
        resolve_path(&self.storage.db_path)
    }

    /// Absolute path of the backup directory.
    pub fn backup_dir(&self) -> PathBuf {
        resolve_path(&self.storage.backup_dir)
    }

    /// Absolute path of the upload/export staging directory.
    pub fn temp_dir(&self) -> PathBuf {
        resolve_path(&self.storage.temp_dir)
    }

    /// Resolve a configured path against the data directory.
    pub fn resolve_path(path: &str) -> PathBuf {
        resolve_path(path)
    }

    /// Reject values the storage core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.storage.reader_pool_size == 0 {
            return Err(SettingsError::InvalidValue(
                "storage.readerPoolSize must be at least 1".into(),
            ));
        }
        if self.storage.db_path.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "storage.dbPath must not be empty".into(),
            ));
        }
        if self.maintenance.retention_days == 0 {
            return Err(SettingsError::InvalidValue(
                "maintenance.retentionDays must be at least 1".into(),
            ));
        }
        if self.compression.level > 9 {
            return Err(SettingsError::InvalidValue(format!(
                "compression.level must be 0-9, got {}",
                self.compression.level
            )));
        }
        Ok(())
    }
}

/// Parley's data directory (`~/.parley`).
pub fn data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

fn resolve_path(path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        data_dir().join(path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_under_data_dir() {
        let settings = ParleySettings::default();
        assert!(settings.db_path().starts_with(data_dir()));
        assert!(settings.backup_dir().ends_with("backups"));
    }

    #[test]
    fn absolute_paths_are_kept() {
        assert_eq!(
            ParleySettings::resolve_path("/srv/parley/chat.db"),
            PathBuf::from("/srv/parley/chat.db")
        );
    }

    #[test]
    fn rooted_at_places_everything_under_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ParleySettings::rooted_at(dir.path());
        assert_eq!(settings.db_path(), dir.path().join("parley.db"));
        assert_eq!(settings.backup_dir(), dir.path().join("backups"));
        assert_eq!(settings.temp_dir(), dir.path().join("tmp"));
    }

    #[test]
    fn validate_rejects_zero_pool() {
        let mut settings = ParleySettings::default();
        settings.storage.reader_pool_size = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("readerPoolSize"));
    }

    #[test]
    fn validate_rejects_zero_retention() {
        let mut settings = ParleySettings::default();
        settings.maintenance.retention_days = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_level() {
        let mut settings = ParleySettings::default();
        settings.compression.level = 12;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn camel_case_round_trip() {
        let settings = ParleySettings::default();
        let json = serde_json::to_value(&settings).unwrap();
        assert!(json["storage"]["readerPoolSize"].is_number());
        assert!(json["maintenance"]["retentionDays"].is_number());
    }
}
