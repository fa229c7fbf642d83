//! `SQLite` connection management and transaction scopes.

pub mod connection;
pub mod transaction;

pub use connection::{AccessMode, ConnectionConfig, ConnectionPool, PooledConnection, PragmaState, pragma_state};
pub use transaction::TransactionScope;

/// Current wall-clock time in Unix milliseconds, the unit of every
/// timestamp column.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
