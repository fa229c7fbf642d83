//! Maintenance cadence and seed-data settings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Parameters for a maintenance run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaintenanceSettings {
    /// Audit and message-history rows older than this are purged.
    pub retention_days: u32,
    /// Staging files older than this are treated as orphaned.
    pub temp_file_max_age_hours: u64,
    /// Backups kept after pruning (0 keeps every backup).
    pub keep_backups: usize,
    /// Run the blocking full compaction instead of the incremental pass.
    pub aggressive_optimize: bool,
    /// Gzip the backup produced by a maintenance run.
    pub compress_backups: bool,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            retention_days: 90,
            temp_file_max_age_hours: 24,
            keep_backups: 14,
            aggressive_optimize: false,
            compress_backups: true,
        }
    }
}

/// Reference data created by schema initialization.
///
/// The administrative account is only created when both a username and a
/// password are configured and the store has no users at all.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SeedSettings {
    /// Username of the default administrative account.
    pub admin_username: Option<String>,
    /// Initial password of the default administrative account.
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,
    /// Contact address of the default administrative account.
    pub admin_email: Option<String>,
}

impl SeedSettings {
    /// Username and password, when an admin account should be seeded.
    pub fn admin_credentials(&self) -> Option<(&str, &str)> {
        match (&self.admin_username, &self.admin_password) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user.as_str(), password.as_str()))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for SeedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedSettings")
            .field("admin_username", &self.admin_username)
            .field(
                "admin_password",
                &self.admin_password.as_ref().map(|_| "<redacted>"),
            )
            .field("admin_email", &self.admin_email)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_credentials_require_both_fields() {
        let mut seed = SeedSettings {
            admin_username: Some("admin".into()),
            ..Default::default()
        };
        assert!(seed.admin_credentials().is_none());

        seed.admin_password = Some("hunter2".into());
        assert_eq!(seed.admin_credentials(), Some(("admin", "hunter2")));
    }

    #[test]
    fn debug_redacts_password() {
        let seed = SeedSettings {
            admin_username: Some("admin".into()),
            admin_password: Some("hunter2".into()),
            admin_email: None,
        };
        let rendered = format!("{seed:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn password_is_never_serialized() {
        let seed = SeedSettings {
            admin_username: Some("admin".into()),
            admin_password: Some("hunter2".into()),
            admin_email: None,
        };
        let json = serde_json::to_string(&seed).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
