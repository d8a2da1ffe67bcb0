// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Durable row storage for the sync queue.
//!
//! [`QueueStore`] only reads and writes rows; ordering, claiming and retry
//! bookkeeping live in [`QueueManager`](crate::queue::QueueManager), which
//! holds the store behind its mutex.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{format_timestamp, parse_db, parse_timestamp, parse_timestamp_opt};
use crate::error::{Error, Result};
use crate::item::{DeadLetter, ErrorRecord, ItemKind, ItemStatus, Priority, SyncItem, SyncPayload};

const ITEM_COLUMNS: &str = "seq, id, item_type, payload, priority, status, attempt_count,
     last_attempt_at, next_retry_at, created_at";

/// A row as read from disk, before any interpretation.
struct RawRow {
    seq: i64,
    id: String,
    item_type: String,
    payload: String,
    priority: i64,
    status: String,
    attempt_count: i64,
    last_attempt_at: Option<String>,
    next_retry_at: Option<String>,
    created_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            seq: row.get(0)?,
            id: row.get(1)?,
            item_type: row.get(2)?,
            payload: row.get(3)?,
            priority: row.get(4)?,
            status: row.get(5)?,
            attempt_count: row.get(6)?,
            last_attempt_at: row.get(7)?,
            next_retry_at: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    /// Interpret the row, or explain why it cannot be.
    fn decode(self) -> Loaded {
        match self.try_decode() {
            Ok(item) => Loaded::Item(item),
            Err(reason) => Loaded::Unreadable { id: self.id, reason },
        }
    }

    fn try_decode(&self) -> std::result::Result<SyncItem, String> {
        let payload: SyncPayload =
            serde_json::from_str(&self.payload).map_err(|e| format!("unreadable payload: {e}"))?;
        if payload.kind().as_str() != self.item_type {
            return Err(format!(
                "payload type {} does not match item_type {}",
                payload.kind(),
                self.item_type
            ));
        }

        let decoded = || -> std::result::Result<SyncItem, rusqlite::Error> {
            Ok(SyncItem {
                id: self.id.clone(),
                payload,
                priority: Priority::from_rank(self.priority).map_err(to_sql_err)?,
                status: parse_db(&self.status, "status")?,
                attempt_count: u32::try_from(self.attempt_count).unwrap_or(0),
                last_attempt_at: parse_timestamp_opt(self.last_attempt_at.clone(), "last_attempt_at")?,
                next_retry_at: parse_timestamp_opt(self.next_retry_at.clone(), "next_retry_at")?,
                created_at: parse_timestamp(&self.created_at, "created_at")?,
                seq: self.seq,
            })
        };
        decoded().map_err(|e| e.to_string())
    }
}

fn to_sql_err(e: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Integer, Box::new(e))
}

/// Outcome of reading one row during startup.
#[derive(Debug)]
pub enum Loaded {
    Item(SyncItem),
    /// The row exists but cannot be turned into a [`SyncItem`].
    Unreadable { id: String, reason: String },
}

/// Row-level access to `sync_items` and `sync_errors`.
pub struct QueueStore {
    conn: Connection,
}

impl QueueStore {
    pub fn new(conn: Connection) -> Self {
        QueueStore { conn }
    }

    /// Insert a new item, returning its sequence number.
    pub fn insert(&self, item: &SyncItem) -> Result<i64> {
        let payload = serde_json::to_string(&item.payload)?;
        self.conn.execute(
            "INSERT INTO sync_items (id, item_type, payload, priority, status, attempt_count,
             last_attempt_at, next_retry_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.id,
                item.kind().as_str(),
                payload,
                item.priority.rank(),
                item.status.as_str(),
                item.attempt_count,
                item.last_attempt_at.as_ref().map(format_timestamp),
                item.next_retry_at.as_ref().map(format_timestamp),
                format_timestamp(&item.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Read every row, decoded where possible, in insertion order.
    pub fn load_all(&self) -> Result<Vec<Loaded>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_items ORDER BY seq");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], RawRow::from_row)?;

        let mut loaded = Vec::new();
        for row in rows {
            loaded.push(row?.decode());
        }
        Ok(loaded)
    }

    /// Fetch one decodable item by id.
    pub fn get(&self, id: &str) -> Result<Option<SyncItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM sync_items WHERE id = ?1");
        let raw = self
            .conn
            .query_row(&sql, params![id], RawRow::from_row)
            .optional()?;
        match raw.map(RawRow::decode) {
            None => Ok(None),
            Some(Loaded::Item(item)) => Ok(Some(item)),
            Some(Loaded::Unreadable { reason, .. }) => Err(Error::CorruptedData(reason)),
        }
    }

    /// Persist the mutable lifecycle columns of an item.
    pub fn update(&self, item: &SyncItem) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE sync_items SET status = ?2, attempt_count = ?3, last_attempt_at = ?4,
             next_retry_at = ?5 WHERE id = ?1",
            params![
                item.id,
                item.status.as_str(),
                item.attempt_count,
                item.last_attempt_at.as_ref().map(format_timestamp),
                item.next_retry_at.as_ref().map(format_timestamp),
            ],
        )?;
        if changed == 0 {
            return Err(Error::ItemNotFound(item.id.clone()));
        }
        Ok(())
    }

    /// Update several items in one transaction.
    pub fn update_many(&self, items: &[SyncItem]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for item in items {
            self.update(item)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a failed attempt and the item's new state atomically.
    pub fn fail(&self, item: &SyncItem, error: &ErrorRecord) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.insert_error(&item.id, error)?;
        self.update(item)?;
        tx.commit()?;
        Ok(())
    }

    /// Dead-letter a row that could not be decoded.
    pub fn mark_unreadable(&self, id: &str, reason: &str, at: DateTime<Utc>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.conn.execute(
            "UPDATE sync_items SET status = ?2 WHERE id = ?1",
            params![id, ItemStatus::DeadLetter.as_str()],
        )?;
        self.insert_error(
            id,
            &ErrorRecord {
                attempt: 0,
                message: reason.to_string(),
                retryable: false,
                failed_at: at,
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove an item and its error history.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = self
            .conn
            .execute("DELETE FROM sync_items WHERE id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM sync_errors WHERE item_id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// List dead-lettered rows with their error history, oldest first.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_type, payload, attempt_count, created_at FROM sync_items
             WHERE status = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![ItemStatus::DeadLetter.as_str()], |row| {
            let created_str: String = row.get(4)?;
            Ok(DeadLetter {
                id: row.get(0)?,
                item_type: row.get(1)?,
                payload: row.get(2)?,
                attempt_count: row.get(3)?,
                created_at: parse_timestamp(&created_str, "created_at").ok(),
                errors: Vec::new(),
            })
        })?;

        let mut letters = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        for letter in &mut letters {
            letter.errors = self.errors_for(&letter.id)?;
        }
        Ok(letters)
    }

    /// Payloads of dead-lettered rows of one kind. Unreadable payloads are skipped.
    pub fn dead_payloads(&self, kind: ItemKind) -> Result<Vec<SyncPayload>> {
        let mut stmt = self.conn.prepare(
            "SELECT payload FROM sync_items WHERE status = ?1 AND item_type = ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(
            params![ItemStatus::DeadLetter.as_str(), kind.as_str()],
            |row| row.get::<_, String>(0),
        )?;
        let mut payloads = Vec::new();
        for row in rows {
            if let Ok(payload) = serde_json::from_str(&row?) {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }

    /// Error history for one item, oldest first.
    pub fn errors_for(&self, id: &str) -> Result<Vec<ErrorRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT attempt, message, retryable, failed_at FROM sync_errors
             WHERE item_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            let failed_str: String = row.get(3)?;
            Ok(ErrorRecord {
                attempt: row.get(0)?,
                message: row.get(1)?,
                retryable: row.get(2)?,
                failed_at: parse_timestamp(&failed_str, "failed_at")?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Status of a row without decoding its payload.
    pub fn status_of(&self, id: &str) -> Result<Option<ItemStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM sync_items WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        status.map(|s| s.parse()).transpose()
    }

    fn insert_error(&self, id: &str, error: &ErrorRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_errors (item_id, attempt, message, retryable, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                error.attempt,
                error.message,
                error.retryable,
                format_timestamp(&error.failed_at),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "queue_store_tests.rs"]
mod tests;
