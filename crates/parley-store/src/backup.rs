//! Point-in-time backups and restore through the engine's online backup API.
//!
//! A backup is written under a `.partial` name and renamed into place only
//! once it is complete and synced, so a failed attempt never leaves a file
//! at the final path. Every attempt is appended to `backup-history.jsonl`
//! in the backup directory.
//!
//! File names follow `parley-<UTC yyyymmddThhmmss.fffZ>.db`, with a `.gz`
//! suffix for compressed backups.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, DatabaseName, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::codec::CompressionCodec;
use crate::errors::{RestoreFailure, Result, StoreError};
use crate::health::integrity_errors;
use crate::schema::{SCHEMA_VERSION, current_version, table_exists};
use crate::sqlite::{AccessMode, ConnectionPool};

const FILE_PREFIX: &str = "parley-";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
const HISTORY_FILE: &str = "backup-history.jsonl";

/// Integrity check run on the live store after a restore copy.
type RestoreCheck = fn(&Connection) -> rusqlite::Result<Vec<String>>;

/// Outcome of a backup attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// The file exists at `path`.
    Success,
    /// Nothing was left at `path`.
    Failure,
}

/// One backup attempt as recorded in the history log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// When the attempt started.
    pub created_at: DateTime<Utc>,
    /// Final path of the backup file.
    pub path: PathBuf,
    /// Whether the file is gzip-compressed.
    pub compressed: bool,
    /// Success or failure.
    pub status: BackupStatus,
    /// Size of the final file in bytes (0 on failure).
    pub size_bytes: u64,
    /// Failure cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A backup file found in the backup directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    /// Path of the file.
    pub path: PathBuf,
    /// Timestamp encoded in the file name.
    pub created_at: DateTime<Utc>,
    /// Whether the file is gzip-compressed.
    pub compressed: bool,
    /// Size in bytes.
    pub size_bytes: u64,
}

/// Creates, lists, prunes and restores backups.
#[derive(Clone, Debug)]
pub struct BackupManager {
    pool: ConnectionPool,
    codec: CompressionCodec,
    backup_dir: PathBuf,
    verify_restored: RestoreCheck,
}

impl BackupManager {
    /// Create a manager writing into `backup_dir`.
    pub fn new(pool: ConnectionPool, codec: CompressionCodec, backup_dir: PathBuf) -> Self {
        Self {
            pool,
            codec,
            backup_dir,
            verify_restored: integrity_errors,
        }
    }

    #[cfg(test)]
    fn with_restore_check(mut self, check: RestoreCheck) -> Self {
        self.verify_restored = check;
        self
    }

    /// Directory receiving backups and the history log.
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Take a consistent snapshot of the live store.
    ///
    /// New write transactions are held back while the snapshot is copied;
    /// readers are unaffected. Compression happens after writers resume.
    pub fn backup(&self, compress: bool) -> Result<BackupRecord> {
        let started = Instant::now();
        let created_at = Utc::now();
        let stem = format!("{FILE_PREFIX}{}", created_at.format(TIMESTAMP_FORMAT));
        let path = self
            .backup_dir
            .join(if compress { format!("{stem}.db.gz") } else { format!("{stem}.db") });

        let result = self.write_backup(&stem, &path, compress);
        let record = BackupRecord {
            created_at,
            path: path.clone(),
            compressed: compress,
            status: if result.is_ok() {
                BackupStatus::Success
            } else {
                BackupStatus::Failure
            },
            size_bytes: *result.as_ref().unwrap_or(&0),
            error: result.as_ref().err().map(ToString::to_string),
        };
        self.append_history(&record);

        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(size_bytes) => {
                info!(path = %path.display(), compressed = compress, size_bytes, duration_ms, "backup created");
                Ok(record)
            }
            Err(e) => {
                error!(
                    operation = "backup",
                    duration_ms,
                    path = %path.display(),
                    error = %e,
                    "backup failed"
                );
                Err(StoreError::Backup {
                    message: e.to_string(),
                })
            }
        }
    }

    fn write_backup(&self, stem: &str, path: &Path, compress: bool) -> Result<u64> {
        fs::create_dir_all(&self.backup_dir)?;
        let snapshot = PartialFile::new(self.backup_dir.join(format!("{stem}.db.partial")));
        {
            let _paused = self.pool.pause_writers(self.pool.config().writer_pause_timeout)?;
            let conn = self.pool.acquire(AccessMode::ReadOnly)?;
            conn.backup(DatabaseName::Main, snapshot.path(), None)?;
        }

        if compress {
            let staged = PartialFile::new(append_suffix(path, ".partial"));
            let mut input = File::open(snapshot.path())?;
            let (_, output) = self.codec.gzip_stream(&mut input, File::create(staged.path())?)?;
            output.sync_all()?;
            staged.persist(path)?;
        } else {
            File::open(snapshot.path())?.sync_all()?;
            snapshot.persist(path)?;
        }
        Ok(fs::metadata(path)?.len())
    }

    fn append_history(&self, record: &BackupRecord) {
        let appended = serde_json::to_string(record)
            .map_err(std::io::Error::from)
            .and_then(|line| {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.backup_dir.join(HISTORY_FILE))?;
                writeln!(file, "{line}")
            });
        if let Err(e) = appended {
            warn!(path = %self.backup_dir.display(), error = %e, "failed to append backup history");
        }
    }

    /// Every recorded backup attempt, oldest first. Unreadable lines are
    /// skipped.
    pub fn history(&self) -> Result<Vec<BackupRecord>> {
        let file = match File::open(self.backup_dir.join(HISTORY_FILE)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping malformed backup history line"),
            }
        }
        Ok(records)
    }

    /// Backup files in the backup directory, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        let dir = match fs::read_dir(&self.backup_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((created_at, compressed)) = parse_backup_name(&name) else {
                continue;
            };
            entries.push(BackupEntry {
                path: entry.path(),
                created_at,
                compressed,
                size_bytes: entry.metadata()?.len(),
            });
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.path.cmp(&a.path)));
        Ok(entries)
    }

    /// Delete all but the newest `keep` backups. `keep == 0` keeps all.
    /// Returns the number of files removed.
    pub fn prune_backups(&self, keep: usize) -> Result<usize> {
        if keep == 0 {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in self.list_backups()?.into_iter().skip(keep) {
            match fs::remove_file(&entry.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path.display(), error = %e, "failed to remove old backup"),
            }
        }
        if removed > 0 {
            info!(removed, keep, "pruned old backups");
        }
        Ok(removed)
    }

    /// Replace the live store with the backup at `source`.
    ///
    /// The candidate is validated (schema version and integrity) before the
    /// live store is touched. A safety snapshot of the live store is taken
    /// first and put back if the restored store fails its integrity check.
    /// All cached connections are invalidated so later acquisitions reopen.
    pub fn restore(&self, source: &Path) -> Result<()> {
        let started = Instant::now();
        let result = self.restore_inner(source);
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => info!(path = %source.display(), duration_ms, "store restored"),
            Err(e) => error!(
                operation = "restore",
                duration_ms,
                path = %source.display(),
                error = %e,
                "restore failed"
            ),
        }
        result
    }

    fn restore_inner(&self, source: &Path) -> Result<()> {
        if !source.is_file() {
            return Err(RestoreFailure::MissingSource(source.to_path_buf()).into());
        }
        fs::create_dir_all(&self.backup_dir).map_err(copy_failure)?;

        let inflated = if is_compressed(source) {
            let staged = PartialFile::new(self.staging_path("restore"));
            let input = File::open(source).map_err(copy_failure)?;
            let mut output = File::create(staged.path()).map_err(copy_failure)?;
            let _ = CompressionCodec::gunzip_stream(input, &mut output)
                .map_err(|e| RestoreFailure::CorruptSource(format!("cannot decompress: {e}")))?;
            Some(staged)
        } else {
            None
        };
        let candidate = inflated.as_ref().map_or(source, PartialFile::path);
        validate_candidate(candidate)?;

        let wait = self.pool.config().exclusive_timeout;
        let _exclusive = self
            .pool
            .pause_writers(wait)
            .map_err(|_| RestoreFailure::Busy(wait.as_millis() as u64))?;
        self.pool.invalidate()?;

        let mut live = self.pool.open_dedicated()?;
        let safety = PartialFile::new(self.staging_path("pre-restore"));
        live.backup(DatabaseName::Main, safety.path(), None)
            .map_err(|e| RestoreFailure::Copy(format!("safety snapshot: {e}")))?;

        live.restore(DatabaseName::Main, candidate, None::<fn(rusqlite::backup::Progress)>)
            .map_err(|e| RestoreFailure::Copy(format!("copy into live store: {e}")))?;

        let problems = (self.verify_restored)(&live).unwrap_or_else(|e| vec![e.to_string()]);
        if !problems.is_empty() {
            warn!(path = %self.pool.path().display(), "restored store is damaged, putting previous store back");
            live.restore(DatabaseName::Main, safety.path(), None::<fn(rusqlite::backup::Progress)>)
                .map_err(|e| RestoreFailure::Copy(format!("rollback to safety snapshot: {e}")))?;
            drop(live);
            self.pool.invalidate()?;
            return Err(RestoreFailure::IntegrityCheck(problems.join("; ")).into());
        }

        drop(live);
        self.pool.invalidate()?;
        Ok(())
    }

    fn staging_path(&self, purpose: &str) -> PathBuf {
        self.backup_dir
            .join(format!(".{purpose}-{}.db.partial", Uuid::now_v7()))
    }
}

/// Check a restore candidate without modifying it.
fn validate_candidate(path: &Path) -> Result<()> {
    let corrupt = |e: rusqlite::Error| RestoreFailure::CorruptSource(e.to_string());
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX)
        .map_err(corrupt)?;
    conn.execute_batch("PRAGMA query_only = ON").map_err(corrupt)?;

    let version = match table_exists(&conn, "schema_version") {
        Ok(true) => current_version(&conn),
        Ok(false) => Ok(0),
        Err(e) => Err(e),
    }
    .map_err(|e| RestoreFailure::CorruptSource(e.to_string()))?;
    if version == 0 || version > SCHEMA_VERSION {
        return Err(RestoreFailure::IncompatibleVersion {
            found: version,
            supported: SCHEMA_VERSION,
        }
        .into());
    }

    let problems = integrity_errors(&conn).map_err(corrupt)?;
    if !problems.is_empty() {
        return Err(RestoreFailure::CorruptSource(problems.join("; ")).into());
    }
    Ok(())
}

fn copy_failure(e: std::io::Error) -> RestoreFailure {
    RestoreFailure::Copy(e.to_string())
}

fn is_compressed(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Parse `parley-<timestamp>.db[.gz]`.
fn parse_backup_name(name: &str) -> Option<(DateTime<Utc>, bool)> {
    let rest = name.strip_prefix(FILE_PREFIX)?;
    let (stamp, compressed) = match rest.strip_suffix(".db.gz") {
        Some(stamp) => (stamp, true),
        None => (rest.strip_suffix(".db")?, false),
    };
    let created = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some((created.and_utc(), compressed))
}

/// A file that is removed on drop unless persisted under its final name.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persist(mut self, target: &Path) -> std::io::Result<()> {
        fs::rename(&self.path, target)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
