// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite store shared by the queue, cache, download ledger, and conflict list.
//!
//! Each manager opens its own [`Connection`] against the same file.
//! The schema is applied through [`run_migrations`], the single migration
//! path for every crate.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
pub use rusqlite::Connection;
use rusqlite::ErrorCode;
use tracing::warn;

use crate::error::{Error, Result};

/// SQL schema for the sync store.
pub const SCHEMA: &str = r#"
-- Durable work queue; completed items are deleted
CREATE TABLE IF NOT EXISTS sync_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    item_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    next_retry_at TEXT,
    created_at TEXT NOT NULL
);

-- Error history, kept for dead-letter diagnostics
CREATE TABLE IF NOT EXISTS sync_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    message TEXT NOT NULL,
    retryable INTEGER NOT NULL,
    failed_at TEXT NOT NULL
);

-- Published cache versions, one row per (subject, level, year)
CREATE TABLE IF NOT EXISTS cache_entries (
    subject TEXT NOT NULL,
    level TEXT NOT NULL,
    year INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    item_count INTEGER NOT NULL,
    content TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (subject, level, year)
);

-- Questions the user has worked through
CREATE TABLE IF NOT EXISTS consumption (
    subject TEXT NOT NULL,
    level TEXT NOT NULL,
    year INTEGER NOT NULL,
    question_id TEXT NOT NULL,
    consumed_at TEXT NOT NULL,
    PRIMARY KEY (subject, level, year, question_id)
);

-- Years the server reported as not published
CREATE TABLE IF NOT EXISTS content_gaps (
    subject TEXT NOT NULL,
    level TEXT NOT NULL,
    year INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (subject, level, year)
);

CREATE TABLE IF NOT EXISTS download_records (
    content_id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    status TEXT NOT NULL,
    bytes_downloaded INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    reported_at TEXT NOT NULL
);

-- Progress fields awaiting a user decision
CREATE TABLE IF NOT EXISTS progress_conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL,
    field TEXT NOT NULL,
    local TEXT NOT NULL,
    remote TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    UNIQUE (record_id, field)
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_sync_items_status ON sync_items(status);
CREATE INDEX IF NOT EXISTS idx_sync_errors_item ON sync_errors(item_id);
"#;

/// Run schema creation and all migrations on a database connection.
///
/// Idempotent; safe to call on every open.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    migrate_add_needs_refresh(conn)?;
    Ok(())
}

/// Migration: Add needs_refresh flag to cache entries written by older builds.
fn migrate_add_needs_refresh(conn: &Connection) -> Result<()> {
    let has_column: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('cache_entries') WHERE name = 'needs_refresh'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(false);

    if !has_column {
        conn.execute(
            "ALTER TABLE cache_entries ADD COLUMN needs_refresh INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

/// Open a store connection at `path`, creating and migrating if needed.
///
/// A file SQLite refuses to read, or one failing `PRAGMA quick_check`, is
/// renamed to `<name>.corrupt-<unix_ts>` and replaced by a fresh store.
pub fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    match try_open(path) {
        Ok(conn) => Ok(conn),
        Err(e) if is_corruption(&e) => {
            let moved = quarantine(path)?;
            warn!(
                path = %path.display(),
                moved_to = %moved.display(),
                error = %e,
                "store is unreadable, starting with a fresh one"
            );
            try_open(path)
        }
        Err(e) => Err(e),
    }
}

/// Open an in-memory store (for testing).
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn try_open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;",
    )?;

    let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if check != "ok" {
        return Err(Error::CorruptedData(format!("quick_check failed: {check}")));
    }

    run_migrations(&conn)?;
    Ok(conn)
}

fn is_corruption(err: &Error) -> bool {
    match err {
        Error::CorruptedData(_) => true,
        Error::Database(e) => matches!(
            e.sqlite_error_code(),
            Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
        ),
        _ => false,
    }
}

/// Move a damaged store (and its WAL sidecars) out of the way.
fn quarantine(path: &Path) -> Result<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().timestamp());
    let target = sibling(path, &suffix);
    std::fs::rename(path, &target)?;

    for sidecar in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(sidecar);
        let side = PathBuf::from(name);
        if side.exists() {
            std::fs::remove_file(&side)?;
        }
    }
    Ok(target)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Format a timestamp for storage.
///
/// Fixed-width nanosecond RFC3339 in UTC, so text ordering matches time
/// ordering.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a string value from the database, returning a rusqlite error on parse failure.
pub(crate) fn parse_db<T: std::str::FromStr>(
    value: &str,
    column: &str,
) -> std::result::Result<T, rusqlite::Error> {
    value.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(Error::CorruptedData(format!(
                "invalid value '{value}' in column '{column}'"
            ))),
        )
    })
}

/// Parse an RFC3339 timestamp from the database.
pub(crate) fn parse_timestamp(
    value: &str,
    column: &str,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(Error::CorruptedData(format!(
                    "invalid timestamp '{value}' in column '{column}'"
                ))),
            )
        })
}

/// Parse an optional RFC3339 timestamp from the database.
pub(crate) fn parse_timestamp_opt(
    value: Option<String>,
    column: &str,
) -> std::result::Result<Option<DateTime<Utc>>, rusqlite::Error> {
    value.map(|s| parse_timestamp(&s, column)).transpose()
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;
