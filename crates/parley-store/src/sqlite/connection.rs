//! Connection pool with pooled readers and one write connection per thread.
//!
//! Read-only handles come from an `r2d2` pool; the [`ReaderCustomizer`]
//! tunes each new handle and marks it `query_only`. Each thread owns at most
//! one write handle, kept in a slot table keyed by [`ThreadId`] and leased
//! out by [`ConnectionPool::acquire`]. A lease puts its handle back into the
//! slot when dropped; the slot itself is closed when its thread exits.
//!
//! A process-wide write gate is held shared by every open transaction and
//! exclusively by operations that need writers paused (backup, restore,
//! aggressive optimize).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use parley_settings::{ParleySettings, StorageSettings};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info, warn};

use super::transaction::TransactionScope;
use crate::errors::{Result, StoreError};

/// Requested access for [`ConnectionPool::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Pooled handle that refuses writes.
    ReadOnly,
    /// The calling thread's write handle.
    ReadWrite,
}

/// Location and tuning of every handle the pool opens.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Store file.
    pub path: PathBuf,
    /// Maximum number of pooled read handles.
    pub reader_pool_size: u32,
    /// Engine busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache per handle in KiB.
    pub cache_size_kib: i64,
    /// Memory-mapped I/O window per handle in bytes.
    pub mmap_size_bytes: i64,
    /// Maximum wait for a read handle or the shared write gate.
    pub acquire_timeout: Duration,
    /// Maximum wait for in-flight transactions to drain before a backup.
    pub writer_pause_timeout: Duration,
    /// Maximum wait for exclusivity before a restore or full compaction.
    pub exclusive_timeout: Duration,
}

impl ConnectionConfig {
    /// Default tuning for a store at `path`.
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self::from_storage(path.into(), &StorageSettings::default())
    }

    /// Tuning from the `storage` settings section.
    pub fn from_settings(settings: &ParleySettings) -> Self {
        Self::from_storage(settings.db_path(), &settings.storage)
    }

    fn from_storage(path: PathBuf, storage: &StorageSettings) -> Self {
        Self {
            path,
            reader_pool_size: storage.reader_pool_size,
            busy_timeout_ms: storage.busy_timeout_ms,
            cache_size_kib: storage.cache_size_kib,
            mmap_size_bytes: storage.mmap_size_bytes,
            acquire_timeout: Duration::from_millis(storage.acquire_timeout_ms),
            writer_pause_timeout: Duration::from_millis(storage.writer_pause_timeout_ms),
            exclusive_timeout: Duration::from_millis(storage.restore_lock_timeout_ms),
        }
    }
}

/// Statement used to check that a cached handle still reaches the store file.
const LIVENESS_CHECK: &str = "SELECT count(*) FROM sqlite_master";

/// Opens read handles and validates them on checkout against the store file.
struct ReaderManager(SqliteConnectionManager);

impl r2d2::ManageConnection for ReaderManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> std::result::Result<Connection, rusqlite::Error> {
        r2d2::ManageConnection::connect(&self.0)
    }

    fn is_valid(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.query_row(LIVENESS_CHECK, [], |row| row.get::<_, i64>(0))
            .map(|_| ())
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        r2d2::ManageConnection::has_broken(&self.0, conn)
    }
}

/// Pragmas applied to every new read handle.
#[derive(Debug)]
struct ReaderCustomizer {
    busy_timeout_ms: u32,
    cache_size_kib: i64,
    mmap_size_bytes: i64,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ReaderCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};\
             PRAGMA cache_size = -{};\
             PRAGMA mmap_size = {};\
             PRAGMA query_only = ON;",
            self.busy_timeout_ms, self.cache_size_kib, self.mmap_size_bytes
        ))
    }
}

/// Shared handle to the store's connections. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: ConnectionConfig,
    readers: RwLock<Pool<ReaderManager>>,
    writers: Mutex<HashMap<ThreadId, WriterSlot>>,
    generation: AtomicU64,
    pub(crate) write_gate: RwLock<()>,
    pub(crate) open_transactions: AtomicUsize,
}

impl PoolInner {
    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

enum WriterSlot {
    Idle(CachedWriter),
    Leased,
}

struct CachedWriter {
    conn: Connection,
    generation: u64,
}

impl ConnectionPool {
    /// Create a pool for the store described by `config`.
    ///
    /// No handle is opened until the first acquisition; only the parent
    /// directory of the store file is created.
    pub fn open(config: ConnectionConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Connection {
                message: format!("cannot create {}: {e}", parent.display()),
            })?;
        }
        let readers = build_reader_pool(&config)?;
        debug!(path = %config.path.display(), "connection pool ready");
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                readers: RwLock::new(readers),
                writers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                write_gate: RwLock::new(()),
                open_transactions: AtomicUsize::new(0),
            }),
        })
    }

    /// Store file this pool opens.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Tuning in effect.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Lease a handle.
    ///
    /// `ReadWrite` returns the calling thread's cached write handle, opening
    /// and tuning it on first use. Either mode checks the handle before
    /// returning it and transparently replaces one that does not answer.
    pub fn acquire(&self, mode: AccessMode) -> Result<PooledConnection> {
        let handle = match mode {
            AccessMode::ReadOnly => {
                let pool = self.inner.readers.read().clone();
                Handle::Reader(pool.get().map_err(|e| self.checkout_error(&pool, e))?)
            }
            AccessMode::ReadWrite => Handle::Writer(self.lease_writer()?),
        };
        Ok(PooledConnection {
            handle,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Run `f` inside a write transaction on this thread's write handle.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.acquire(AccessMode::ReadWrite)?;
        let tx = conn.begin()?;
        let value = f(&*tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Number of write transactions currently open across all threads.
    pub fn open_write_transactions(&self) -> usize {
        self.inner.open_transactions.load(Ordering::Acquire)
    }

    /// Block new write transactions until the returned guard is dropped.
    ///
    /// Waits at most `timeout` for open transactions to finish.
    pub fn pause_writers(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, ()>> {
        self.inner
            .write_gate
            .try_write_for(timeout)
            .ok_or(StoreError::LockTimeout {
                resource: "write gate",
                waited_ms: timeout.as_millis() as u64,
            })
    }

    /// Discard every idle handle and rebuild the reader pool.
    ///
    /// Handles leased at the time of the call keep working until they are
    /// returned, then they are closed instead of cached.
    pub fn invalidate(&self) -> Result<()> {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let stale: Vec<CachedWriter> = {
            let mut slots = self.inner.writers.lock();
            let idle: Vec<ThreadId> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, WriterSlot::Idle(_)))
                .map(|(id, _)| *id)
                .collect();
            idle.into_iter()
                .filter_map(|id| match slots.remove(&id) {
                    Some(WriterSlot::Idle(writer)) => Some(writer),
                    _ => None,
                })
                .collect()
        };
        let closed = stale.len();
        drop(stale);

        let fresh = build_reader_pool(&self.inner.config)?;
        *self.inner.readers.write() = fresh;
        info!(generation, closed_writers = closed, "connections invalidated");
        Ok(())
    }

    /// A checkout that timed out while every reader was leased is contention,
    /// not an unreachable store.
    fn checkout_error(&self, pool: &Pool<ReaderManager>, err: r2d2::Error) -> StoreError {
        let state = pool.state();
        if state.connections >= pool.max_size() && state.idle_connections == 0 {
            return StoreError::LockTimeout {
                resource: "reader pool",
                waited_ms: self.inner.config.acquire_timeout.as_millis() as u64,
            };
        }
        err.into()
    }

    /// Open a tuned write handle outside the slot table.
    pub(crate) fn open_dedicated(&self) -> Result<Connection> {
        open_writer(&self.inner.config)
    }

    fn lease_writer(&self) -> Result<WriterLease> {
        let thread = thread::current().id();
        let cached = {
            let mut slots = self.inner.writers.lock();
            match slots.insert(thread, WriterSlot::Leased) {
                Some(WriterSlot::Leased) => return Err(StoreError::WriterLeased),
                Some(WriterSlot::Idle(writer)) => Some(writer),
                None => {
                    register_writer_thread(&self.inner, thread);
                    None
                }
            }
        };

        match self.materialize_writer(cached) {
            Ok(writer) => Ok(WriterLease {
                pool: Arc::clone(&self.inner),
                thread,
                writer: Some(writer),
            }),
            Err(err) => {
                let _ = self.inner.writers.lock().remove(&thread);
                Err(err)
            }
        }
    }

    fn materialize_writer(&self, cached: Option<CachedWriter>) -> Result<CachedWriter> {
        let generation = self.inner.generation.load(Ordering::Acquire);
        if let Some(writer) = cached {
            if writer.generation == generation && is_alive(&writer.conn) {
                return Ok(writer);
            }
            debug!(
                stale = writer.generation != generation,
                "replacing cached write connection"
            );
        }
        let conn = open_writer(&self.inner.config)?;
        Ok(CachedWriter { conn, generation })
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.inner.config.path)
            .field("generation", &self.inner.generation.load(Ordering::Relaxed))
            .field("open_transactions", &self.open_write_transactions())
            .finish_non_exhaustive()
    }
}

/// A leased handle. Dereferences to [`rusqlite::Connection`].
///
/// Never close it: dropping the lease returns the handle for reuse.
pub struct PooledConnection {
    handle: Handle,
    pool: Arc<PoolInner>,
}

enum Handle {
    Reader(r2d2::PooledConnection<ReaderManager>),
    Writer(WriterLease),
}

impl PooledConnection {
    /// Access mode this handle was leased with.
    pub fn mode(&self) -> AccessMode {
        match self.handle {
            Handle::Reader(_) => AccessMode::ReadOnly,
            Handle::Writer(_) => AccessMode::ReadWrite,
        }
    }

    /// Open a write transaction on this handle.
    ///
    /// Fails with [`StoreError::TransactionState`] on a read-only handle or
    /// when a transaction is already open; nesting is not supported.
    pub fn begin(&self) -> Result<TransactionScope<'_>> {
        if self.mode() != AccessMode::ReadWrite {
            return Err(StoreError::TransactionState(
                "transactions require a read-write connection".into(),
            ));
        }
        TransactionScope::begin(self, &self.pool)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("mode", &self.mode())
            .field("path", &self.pool.config.path)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.handle {
            Handle::Reader(conn) => &**conn,
            Handle::Writer(lease) => lease.conn(),
        }
    }
}

struct WriterLease {
    pool: Arc<PoolInner>,
    thread: ThreadId,
    writer: Option<CachedWriter>,
}

impl WriterLease {
    fn conn(&self) -> &Connection {
        match &self.writer {
            Some(writer) => &writer.conn,
            None => unreachable!("write lease used after release"),
        }
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let current = self.pool.generation.load(Ordering::Acquire);
        let reusable = writer.generation == current && writer.conn.is_autocommit();

        let mut slots = self.pool.writers.lock();
        if reusable {
            let _ = slots.insert(self.thread, WriterSlot::Idle(writer));
        } else {
            let _ = slots.remove(&self.thread);
            drop(slots);
            if !writer.conn.is_autocommit() {
                warn!("write connection returned with an open transaction, closing it");
            }
            drop(writer);
        }
    }
}

thread_local! {
    static WRITER_OWNER: WriterOwner = WriterOwner::default();
}

/// Pools holding a write slot for the current thread. Dropped when the
/// thread exits, closing those slots.
#[derive(Default)]
struct WriterOwner {
    slots: RefCell<Vec<(Weak<PoolInner>, ThreadId)>>,
}

impl Drop for WriterOwner {
    fn drop(&mut self) {
        for (pool, thread) in self.slots.get_mut().drain(..) {
            let Some(pool) = pool.upgrade() else { continue };
            let closed = {
                let mut slots = pool.writers.lock();
                let idle = matches!(slots.get(&thread), Some(WriterSlot::Idle(_)));
                if idle { slots.remove(&thread) } else { None }
            };
            if closed.is_some() {
                debug!(path = %pool.config.path.display(), "closed write connection of exited thread");
            }
        }
    }
}

fn register_writer_thread(pool: &Arc<PoolInner>, thread: ThreadId) {
    // Fails only while the thread is already tearing down its locals.
    let _ = WRITER_OWNER.try_with(|owner| {
        let mut slots = owner.slots.borrow_mut();
        slots.retain(|(weak, _)| weak.strong_count() > 0);
        if !slots.iter().any(|(weak, _)| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(pool))) {
            slots.push((Arc::downgrade(pool), thread));
        }
    });
}

fn build_reader_pool(config: &ConnectionConfig) -> Result<Pool<ReaderManager>> {
    let manager = ReaderManager(SqliteConnectionManager::file(&config.path).with_flags(
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ));
    let pool = Pool::builder()
        .max_size(config.reader_pool_size)
        .min_idle(Some(0))
        .connection_timeout(config.acquire_timeout)
        .connection_customizer(Box::new(ReaderCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
            cache_size_kib: config.cache_size_kib,
            mmap_size_bytes: config.mmap_size_bytes,
        }))
        .build(manager)?;
    Ok(pool)
}

/// Open and tune a write handle.
///
/// `busy_timeout` is applied first so that the remaining pragmas wait for
/// the engine lock instead of failing immediately.
fn open_writer(config: &ConnectionConfig) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        &config.path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| StoreError::Connection {
        message: format!("cannot open {}: {e}", config.path.display()),
    })?;

    conn.busy_timeout(Duration::from_millis(u64::from(config.busy_timeout_ms)))?;

    // auto_vacuum only takes effect before the first table is created.
    let pages: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
    let auto_vacuum = if pages == 0 {
        "PRAGMA auto_vacuum = INCREMENTAL;"
    } else {
        ""
    };
    conn.execute_batch(&format!(
        "{auto_vacuum}\
         PRAGMA journal_mode = WAL;\
         PRAGMA synchronous = NORMAL;\
         PRAGMA foreign_keys = ON;\
         PRAGMA cache_size = -{};\
         PRAGMA mmap_size = {};",
        config.cache_size_kib, config.mmap_size_bytes
    ))
    .map_err(|e| match StoreError::from_contended(e, "write lock", u64::from(config.busy_timeout_ms)) {
        StoreError::Sqlite(e) => StoreError::Connection {
            message: format!("cannot tune {}: {e}", config.path.display()),
        },
        other => other,
    })?;

    debug!(path = %config.path.display(), "opened write connection");
    Ok(conn)
}

fn is_alive(conn: &Connection) -> bool {
    conn.query_row(LIVENESS_CHECK, [], |row| row.get::<_, i64>(0))
        .is_ok()
}

/// Pragma values observed on a handle.
#[derive(Debug)]
pub struct PragmaState {
    /// Journal mode (`wal` for a healthy store).
    pub journal_mode: String,
    /// Whether foreign keys are enforced on this handle.
    pub foreign_keys_enabled: bool,
    /// Whether the handle refuses writes.
    pub query_only: bool,
}

/// Read back the tuning of a handle.
pub fn pragma_state(conn: &Connection) -> Result<PragmaState> {
    let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    let foreign_keys: i32 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    let query_only: i32 = conn.query_row("PRAGMA query_only", [], |row| row.get(0))?;
    Ok(PragmaState {
        journal_mode: journal_mode.to_ascii_lowercase(),
        foreign_keys_enabled: foreign_keys == 1,
        query_only: query_only == 1,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
