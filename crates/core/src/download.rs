// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Download lifecycle records.
//!
//! Status updates can arrive out of order when retries interleave, so every
//! record keeps the `reported_at` of the update it reflects and only a
//! strictly newer report replaces it.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{self, format_timestamp, parse_db, parse_timestamp};
use crate::error::{Error, Result};
use crate::item::DownloadStatusUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Started,
    Completed,
    Paused,
    Failed,
}

impl DownloadStatus {
    /// Returns the string representation used in storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Started => "started",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Failed => "failed",
        }
    }

    /// Completed and Failed end a download; only a new start reopens it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "started" => Ok(DownloadStatus::Started),
            "completed" => Ok(DownloadStatus::Completed),
            "paused" => Ok(DownloadStatus::Paused),
            "failed" => Ok(DownloadStatus::Failed),
            _ => Err(Error::InvalidDownloadStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub content_id: String,
    pub device_id: String,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    pub error_message: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Persistent store of [`DownloadRecord`]s.
pub struct DownloadLedger {
    conn: Mutex<Connection>,
}

impl DownloadLedger {
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(db::open_connection(path)?)
    }

    pub fn with_connection(conn: Connection) -> Result<Self> {
        db::run_migrations(&conn)?;
        Ok(DownloadLedger {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a delivered start request.
    ///
    /// Opens (or reopens) the record as `Started`. A resumed download keeps
    /// its byte count. Returns false if a newer report already exists.
    pub fn start(
        &self,
        content_id: &str,
        device_id: &str,
        resume: bool,
        requested_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        let existing = load(&conn, content_id)?;
        if existing.as_ref().is_some_and(|r| r.reported_at >= requested_at) {
            debug!(content_id, "stale download start ignored");
            return Ok(false);
        }

        let bytes = match (&existing, resume) {
            (Some(r), true) => r.bytes_downloaded,
            _ => 0,
        };
        store(
            &conn,
            &DownloadRecord {
                content_id: content_id.to_string(),
                device_id: device_id.to_string(),
                status: DownloadStatus::Started,
                bytes_downloaded: bytes,
                error_message: None,
                reported_at: requested_at,
            },
        )?;
        Ok(true)
    }

    /// Apply a delivered status update if it is the newest report seen.
    ///
    /// Updates never reopen a terminal record. A missing record is created,
    /// since its start may still be waiting in the queue.
    pub fn apply_update(&self, update: &DownloadStatusUpdate, device_id: &str) -> Result<bool> {
        let conn = self.conn();
        if let Some(current) = load(&conn, &update.content_id)? {
            if current.reported_at >= update.reported_at {
                debug!(content_id = %update.content_id, "stale download update ignored");
                return Ok(false);
            }
            if current.status.is_terminal() {
                debug!(content_id = %update.content_id, status = %current.status, "download already finished");
                return Ok(false);
            }
        }

        store(
            &conn,
            &DownloadRecord {
                content_id: update.content_id.clone(),
                device_id: device_id.to_string(),
                status: update.status,
                bytes_downloaded: update.bytes_downloaded,
                error_message: update.error_message.clone(),
                reported_at: update.reported_at,
            },
        )?;
        Ok(true)
    }

    pub fn get(&self, content_id: &str) -> Result<Option<DownloadRecord>> {
        load(&self.conn(), content_id)
    }

    pub fn list(&self) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT content_id, device_id, status, bytes_downloaded, error_message, reported_at
             FROM download_records ORDER BY content_id",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRecord> {
    let status_str: String = row.get(2)?;
    let reported_str: String = row.get(5)?;
    Ok(DownloadRecord {
        content_id: row.get(0)?,
        device_id: row.get(1)?,
        status: parse_db(&status_str, "status")?,
        bytes_downloaded: u64::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
        error_message: row.get(4)?,
        reported_at: parse_timestamp(&reported_str, "reported_at")?,
    })
}

fn load(conn: &Connection, content_id: &str) -> Result<Option<DownloadRecord>> {
    Ok(conn
        .query_row(
            "SELECT content_id, device_id, status, bytes_downloaded, error_message, reported_at
             FROM download_records WHERE content_id = ?1",
            params![content_id],
            row_to_record,
        )
        .optional()?)
}

fn store(conn: &Connection, record: &DownloadRecord) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO download_records
         (content_id, device_id, status, bytes_downloaded, error_message, reported_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.content_id,
            record.device_id,
            record.status.as_str(),
            i64::try_from(record.bytes_downloaded).unwrap_or(i64::MAX),
            record.error_message,
            format_timestamp(&record.reported_at),
        ],
    )?;
    debug!(content_id = %record.content_id, status = %record.status, "download record updated");
    Ok(())
}

#[cfg(test)]
#[path = "download_tests.rs"]
mod tests;
