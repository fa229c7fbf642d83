//! Read-only usage statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::errors::Result;
use crate::schema::TABLES;
use crate::sqlite::{AccessMode, ConnectionPool};

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Tables with an activity timestamp, and the column that carries it.
const ACTIVITY_COLUMNS: &[(&str, &str)] = &[
    ("users", "created_at"),
    ("conversations", "created_at"),
    ("messages", "created_at"),
    ("message_history", "edited_at"),
    ("audit_log", "created_at"),
];

/// Rows created in trailing windows ending at [`StoreStats::taken_at`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityWindow {
    /// Last 60 minutes.
    pub last_hour: u64,
    /// Last 24 hours.
    pub last_day: u64,
    /// Last 7 days.
    pub last_week: u64,
}

/// Point-in-time statistics.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// When the snapshot was read.
    pub taken_at: DateTime<Utc>,
    /// Row count per table.
    pub tables: BTreeMap<String, u64>,
    /// Pages in the main database file.
    pub page_count: u64,
    /// Bytes per page.
    pub page_size: u64,
    /// `page_count * page_size`.
    pub size_bytes: u64,
    /// Unused pages awaiting reuse or reclamation.
    pub freelist_count: u64,
    /// Activity per timestamped table.
    pub activity: BTreeMap<String, ActivityWindow>,
}

/// Collects [`StoreStats`] on pooled read-only connections.
#[derive(Clone, Debug)]
pub struct StatsCollector {
    pool: ConnectionPool,
}

impl StatsCollector {
    /// Create a collector over `pool`.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Read every statistic inside one read transaction, so all numbers
    /// describe the same committed state.
    pub fn snapshot(&self) -> Result<StoreStats> {
        let conn = self.pool.acquire(AccessMode::ReadOnly)?;
        let tx = conn.unchecked_transaction()?;
        let taken_at = Utc::now();
        let now = taken_at.timestamp_millis();

        let mut tables = BTreeMap::new();
        for table in TABLES {
            let _ = tables.insert((*table).to_owned(), row_count(&tx, table)?);
        }

        let page_count = pragma_u64(&tx, "page_count")?;
        let page_size = pragma_u64(&tx, "page_size")?;
        let freelist_count = pragma_u64(&tx, "freelist_count")?;

        let mut activity = BTreeMap::new();
        for (table, column) in ACTIVITY_COLUMNS {
            let _ = activity.insert((*table).to_owned(), activity_window(&tx, table, column, now)?);
        }

        tx.finish()?;
        Ok(StoreStats {
            taken_at,
            tables,
            page_count,
            page_size,
            size_bytes: page_count * page_size,
            freelist_count,
            activity,
        })
    }
}

fn row_count(conn: &Connection, table: &str) -> Result<u64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

fn pragma_u64(conn: &Connection, pragma: &str) -> Result<u64> {
    let value: i64 = conn.query_row(&format!("PRAGMA {pragma}"), [], |row| row.get(0))?;
    Ok(value.max(0) as u64)
}

fn activity_window(conn: &Connection, table: &str, column: &str, now: i64) -> Result<ActivityWindow> {
    let sql = format!(
        "SELECT COALESCE(SUM({column} >= ?1), 0),
                COALESCE(SUM({column} >= ?2), 0),
                COALESCE(SUM({column} >= ?3), 0)
         FROM {table} WHERE {column} >= ?3"
    );
    let (hour, day, week): (i64, i64, i64) = conn.query_row(
        &sql,
        [now - HOUR_MS, now - DAY_MS, now - WEEK_MS],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(ActivityWindow {
        last_hour: hour.max(0) as u64,
        last_day: day.max(0) as u64,
        last_week: week.max(0) as u64,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
