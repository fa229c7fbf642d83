//! Store location, connection tuning and compression settings.

use serde::{Deserialize, Serialize};

/// Store file location and connection-pool tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Store file (relative to `~/.parley` unless absolute).
    pub db_path: String,
    /// Directory receiving backup files and the backup history log.
    pub backup_dir: String,
    /// Staging directory for uploads and exports; swept by maintenance.
    pub temp_dir: String,
    /// Maximum number of pooled read-only connections.
    pub reader_pool_size: u32,
    /// Engine busy timeout in milliseconds (bounded wait for the write lock).
    pub busy_timeout_ms: u32,
    /// Page cache size per connection in KiB.
    pub cache_size_kib: i64,
    /// Memory-mapped I/O window per connection in bytes.
    pub mmap_size_bytes: i64,
    /// Maximum wait for a pooled read connection in milliseconds.
    pub acquire_timeout_ms: u64,
    /// Maximum time a backup waits for in-flight write transactions to drain.
    pub writer_pause_timeout_ms: u64,
    /// Maximum time a restore or aggressive optimize waits for exclusivity.
    pub restore_lock_timeout_ms: u64,
    /// Open write transactions above this count report the store as degraded.
    pub max_open_write_transactions: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: "database/parley.db".to_string(),
            backup_dir: "backups".to_string(),
            temp_dir: "tmp".to_string(),
            reader_pool_size: 16,
            busy_timeout_ms: 5_000,
            cache_size_kib: 8192,
            mmap_size_bytes: 268_435_456,
            acquire_timeout_ms: 5_000,
            writer_pause_timeout_ms: 2_000,
            restore_lock_timeout_ms: 30_000,
            max_open_write_transactions: 8,
        }
    }
}

/// Large text value compression.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionSettings {
    /// Values strictly larger than this many bytes are compressed.
    pub threshold_bytes: usize,
    /// zlib compression level (0-9).
    pub level: u32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            threshold_bytes: 4096,
            level: 6,
        }
    }
}
