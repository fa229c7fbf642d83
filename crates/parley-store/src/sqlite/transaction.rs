//! Scoped write transactions.
//!
//! A [`TransactionScope`] issues `BEGIN IMMEDIATE`, so contention for the
//! engine's write lock surfaces when the scope opens rather than on the
//! first write. Leaving the scope without [`commit`](TransactionScope::commit)
//! rolls back.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::RwLockReadGuard;
use rusqlite::Connection;
use tracing::{debug, warn};

use super::connection::PoolInner;
use crate::errors::{Result, StoreError};

/// An open write transaction. Dereferences to the underlying connection.
pub struct TransactionScope<'c> {
    conn: &'c Connection,
    pool: &'c PoolInner,
    _gate: RwLockReadGuard<'c, ()>,
    started: Instant,
    finished: bool,
}

impl<'c> TransactionScope<'c> {
    pub(crate) fn begin(conn: &'c Connection, pool: &'c PoolInner) -> Result<Self> {
        if !conn.is_autocommit() {
            return Err(StoreError::TransactionState(
                "a transaction is already open on this connection".into(),
            ));
        }

        let wait = pool.config().acquire_timeout;
        let gate = pool
            .write_gate
            .try_read_for(wait)
            .ok_or(StoreError::LockTimeout {
                resource: "write gate",
                waited_ms: wait.as_millis() as u64,
            })?;

        conn.execute_batch("BEGIN IMMEDIATE").map_err(|e| {
            StoreError::from_contended(e, "write lock", u64::from(pool.config().busy_timeout_ms))
        })?;

        let _ = pool.open_transactions.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            conn,
            pool,
            _gate: gate,
            started: Instant::now(),
            finished: false,
        })
    }

    /// Persist every statement issued inside the scope.
    pub fn commit(mut self) -> Result<()> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| StoreError::from_contended(e, "write lock", 0))?;
        self.finished = true;
        debug!(elapsed_ms = self.started.elapsed().as_millis() as u64, "transaction committed");
        Ok(())
    }

    /// Undo every statement issued inside the scope.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl fmt::Debug for TransactionScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("elapsed", &self.started.elapsed())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Deref for TransactionScope<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.conn.is_autocommit() {
            warn!(
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "transaction scope dropped without commit, rolling back"
            );
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "rollback on drop failed");
            }
        }
        let _ = self.pool.open_transactions.fetch_sub(1, Ordering::AcqRel);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
