//! Reference rows created by schema initialization.
//!
//! Each seed only runs when its target table is empty, so a second
//! initialization never duplicates or resurrects rows.

use parley_settings::SeedSettings;
use rusqlite::{Connection, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::Result;
use crate::sqlite::now_ms;

/// Default model catalog: `(name, provider, endpoint, is_default)`.
const DEFAULT_MODELS: &[(&str, &str, Option<&str>, bool)] = &[
    ("llama3.1:8b", "ollama", Some("http://localhost:11434"), true),
    ("mistral:7b", "ollama", Some("http://localhost:11434"), false),
    ("qwen2.5-coder:7b", "ollama", Some("http://localhost:11434"), false),
    ("parley-custom", "custom", None, false),
];

/// Default feature flags: `(key, enabled, description)`.
const DEFAULT_FLAGS: &[(&str, bool, &str)] = &[
    ("message_compression", true, "Store large message bodies compressed"),
    ("conversation_export", true, "Allow users to export conversations"),
    ("model_selection", true, "Let users pick the model per conversation"),
    ("audit_logging", true, "Record administrative actions in the audit log"),
    ("custom_models", false, "Route requests to locally registered custom models"),
];

/// Rows created by a seeding pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedOutcome {
    /// Model catalog rows inserted.
    pub ai_models: usize,
    /// Feature flag rows inserted.
    pub feature_flags: usize,
    /// Whether the default administrative account was created.
    pub admin_created: bool,
}

/// Seed every reference table that is still empty.
pub(crate) fn seed_defaults(conn: &Connection, seed: &SeedSettings) -> Result<SeedOutcome> {
    let now = now_ms();
    let mut outcome = SeedOutcome::default();

    if table_is_empty(conn, "ai_models")? {
        let mut stmt = conn.prepare(
            "INSERT INTO ai_models (name, provider, endpoint, is_default, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        )?;
        for (name, provider, endpoint, is_default) in DEFAULT_MODELS {
            outcome.ai_models += stmt.execute(params![name, provider, endpoint, is_default, now])?;
        }
    }

    if table_is_empty(conn, "feature_flags")? {
        let mut stmt = conn.prepare(
            "INSERT INTO feature_flags (key, enabled, description, updated_at) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (key, enabled, description) in DEFAULT_FLAGS {
            outcome.feature_flags += stmt.execute(params![key, enabled, description, now])?;
        }
    }

    // Only ever on a store with no accounts at all.
    if let Some((username, password)) = seed.admin_credentials() {
        if table_is_empty(conn, "users")? {
            let _ = conn.execute(
                "INSERT INTO users (username, email, password_hash, is_admin, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?4)",
                params![username, seed.admin_email, hash_password(password), now],
            )?;
            outcome.admin_created = true;
            info!(username, "created default administrator");
        }
    }

    Ok(outcome)
}

fn table_is_empty(conn: &Connection, table: &str) -> Result<bool> {
    let exists: bool = conn.query_row(&format!("SELECT NOT EXISTS (SELECT 1 FROM {table})"), [], |row| {
        row.get(0)
    })?;
    Ok(exists)
}

/// Salted SHA-256 digest in the form `sha256$<salt>$<digest>`.
pub fn hash_password(password: &str) -> String {
    let salt = hex(&rand::random::<[u8; 16]>());
    format!("sha256${salt}${}", digest(&salt, password))
}

/// Check `password` against a value produced by [`hash_password`].
pub fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("sha256"), Some(salt), Some(expected)) => digest(salt, password) == expected,
        _ => false,
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
