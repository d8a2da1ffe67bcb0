// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Reconciliation of local progress against server state.
//!
//! Merge rules, applied per field:
//! - Field present on one side only: that side's value is kept
//! - Equal values: no conflict, later timestamp kept
//! - Field with a parked conflict: stays parked until resolved
//! - Both sides changed since the last sync, within the ambiguity window:
//!   parked for the user, local value kept meanwhile
//! - Otherwise: last `updated_at` wins, ties go to the server
//!
//! Records without a counterpart on the other side are left alone. Parked
//! conflicts are stored, so they survive restarts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{to_delta, ClockSource};
use crate::db::{self, format_timestamp, parse_timestamp};
use crate::error::{Error, Result};

/// One field's value and when it was last written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// A mutable progress record (answer history, bookmarks, scores...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub record_id: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// Last successful reconcile of this record. `None` if never synced.
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

/// A field both sides changed too close together to order reliably.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldConflict {
    pub id: u64,
    pub record_id: String,
    pub field: String,
    pub local: FieldValue,
    pub remote: FieldValue,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeepLocal,
    KeepRemote,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Merged versions of every record present on both sides.
    pub merged: Vec<ProgressRecord>,
    /// Conflicts parked or still open after this run.
    pub conflicts: Vec<FieldConflict>,
    pub local_wins: usize,
    pub remote_wins: usize,
}

enum FieldOutcome {
    Local,
    Remote,
    Same,
    Conflict,
}

/// Per-field last-writer-wins merge with a user-visible conflict list.
pub struct ConflictResolver {
    ambiguity_window: Duration,
    conn: Mutex<Connection>,
    clock: Arc<dyn ClockSource>,
}

impl ConflictResolver {
    /// Open the resolver backed by the store file at `path`.
    pub fn open(path: &Path, ambiguity_window: Duration, clock: Arc<dyn ClockSource>) -> Result<Self> {
        Self::with_connection(db::open_connection(path)?, ambiguity_window, clock)
    }

    pub fn with_connection(
        conn: Connection,
        ambiguity_window: Duration,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self> {
        db::run_migrations(&conn)?;
        Ok(ConflictResolver {
            ambiguity_window,
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn compare(
        &self,
        local: &FieldValue,
        remote: &FieldValue,
        synced_at: Option<DateTime<Utc>>,
        parked: bool,
    ) -> FieldOutcome {
        if local.value == remote.value {
            return FieldOutcome::Same;
        }
        if parked {
            return FieldOutcome::Conflict;
        }

        let changed = |v: &FieldValue| changed_since(synced_at, v.updated_at);
        let gap = (local.updated_at - remote.updated_at).abs();
        if changed(local) && changed(remote) && gap <= to_delta(self.ambiguity_window) {
            return FieldOutcome::Conflict;
        }

        if local.updated_at > remote.updated_at {
            FieldOutcome::Local
        } else {
            FieldOutcome::Remote
        }
    }

    /// Merge local records with their server counterparts.
    pub fn reconcile(
        &self,
        local: &[ProgressRecord],
        remote: &[ProgressRecord],
    ) -> Result<ReconcileReport> {
        let now = self.clock.now();
        let remote_by_id: HashMap<&str, &ProgressRecord> =
            remote.iter().map(|r| (r.record_id.as_str(), r)).collect();

        let mut report = ReconcileReport::default();
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        for local_rec in local {
            let Some(remote_rec) = remote_by_id.get(local_rec.record_id.as_str()) else {
                continue;
            };

            let names: BTreeSet<&String> = local_rec
                .fields
                .keys()
                .chain(remote_rec.fields.keys())
                .collect();

            let mut fields = BTreeMap::new();
            for name in names {
                let chosen = match (local_rec.fields.get(name), remote_rec.fields.get(name)) {
                    (Some(l), None) => l.clone(),
                    (None, Some(r)) => r.clone(),
                    (None, None) => continue,
                    (Some(l), Some(r)) => {
                        let parked = parked_id(&conn, &local_rec.record_id, name)?.is_some();
                        match self.compare(l, r, local_rec.synced_at, parked) {
                            FieldOutcome::Same => {
                                if parked {
                                    unpark(&conn, &local_rec.record_id, name)?;
                                    info!(
                                        record = %local_rec.record_id,
                                        field = %name,
                                        "both sides converged, conflict cleared"
                                    );
                                }
                                if l.updated_at >= r.updated_at {
                                    l.clone()
                                } else {
                                    r.clone()
                                }
                            }
                            FieldOutcome::Local => {
                                report.local_wins += 1;
                                l.clone()
                            }
                            FieldOutcome::Remote => {
                                report.remote_wins += 1;
                                r.clone()
                            }
                            FieldOutcome::Conflict => {
                                let conflict = park(&conn, &local_rec.record_id, name, l, r, now)?;
                                if !parked {
                                    warn!(
                                        record = %local_rec.record_id,
                                        field = %name,
                                        id = conflict.id,
                                        "conflicting edits parked for resolution"
                                    );
                                }
                                report.conflicts.push(conflict);
                                l.clone()
                            }
                        }
                    }
                };
                fields.insert(name.clone(), chosen);
            }

            report.merged.push(ProgressRecord {
                record_id: local_rec.record_id.clone(),
                fields,
                synced_at: Some(now),
            });
        }
        tx.commit()?;

        info!(
            merged = report.merged.len(),
            conflicts = report.conflicts.len(),
            local_wins = report.local_wins,
            remote_wins = report.remote_wins,
            "progress reconciled"
        );
        Ok(report)
    }

    /// Conflicts awaiting a user decision, oldest first.
    pub fn pending_conflicts(&self) -> Result<Vec<FieldConflict>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, record_id, field, local, remote, detected_at
             FROM progress_conflicts ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_conflict)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Settle a parked conflict.
    ///
    /// The chosen value is returned stamped with the current time, so it
    /// wins the next reconcile on both sides.
    pub fn resolve(&self, conflict_id: u64, choice: Resolution) -> Result<FieldValue> {
        let conn = self.conn();
        let conflict = conn
            .query_row(
                "SELECT id, record_id, field, local, remote, detected_at
                 FROM progress_conflicts WHERE id = ?1",
                params![to_row_id(conflict_id)],
                row_to_conflict,
            )
            .optional()?
            .ok_or(Error::ConflictNotFound(conflict_id))?;
        conn.execute(
            "DELETE FROM progress_conflicts WHERE id = ?1",
            params![to_row_id(conflict_id)],
        )?;

        let chosen = match choice {
            Resolution::KeepLocal => conflict.local.value,
            Resolution::KeepRemote => conflict.remote.value,
        };
        info!(
            id = conflict_id,
            record = %conflict.record_id,
            field = %conflict.field,
            ?choice,
            "conflict resolved"
        );
        Ok(FieldValue {
            value: chosen,
            updated_at: self.clock.now(),
        })
    }
}

fn to_row_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn row_to_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<FieldConflict> {
    let decode = |idx: usize| -> rusqlite::Result<FieldValue> {
        let text: String = row.get(idx)?;
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    };
    let detected: String = row.get(5)?;
    Ok(FieldConflict {
        id: u64::try_from(row.get::<_, i64>(0)?).unwrap_or(0),
        record_id: row.get(1)?,
        field: row.get(2)?,
        local: decode(3)?,
        remote: decode(4)?,
        detected_at: parse_timestamp(&detected, "detected_at")?,
    })
}

fn parked_id(conn: &Connection, record_id: &str, field: &str) -> Result<Option<u64>> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM progress_conflicts WHERE record_id = ?1 AND field = ?2",
            params![record_id, field],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.and_then(|id| u64::try_from(id).ok()))
}

/// Add or refresh the parked conflict for one record field, keeping its id.
fn park(
    conn: &Connection,
    record_id: &str,
    field: &str,
    local: &FieldValue,
    remote: &FieldValue,
    now: DateTime<Utc>,
) -> Result<FieldConflict> {
    conn.execute(
        "INSERT INTO progress_conflicts (record_id, field, local, remote, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (record_id, field) DO UPDATE SET
             local = excluded.local, remote = excluded.remote, detected_at = excluded.detected_at",
        params![
            record_id,
            field,
            serde_json::to_string(local)?,
            serde_json::to_string(remote)?,
            format_timestamp(&now),
        ],
    )?;
    let id = parked_id(conn, record_id, field)?
        .ok_or_else(|| Error::CorruptedData(format!("conflict for {record_id}.{field} vanished")))?;
    Ok(FieldConflict {
        id,
        record_id: record_id.to_string(),
        field: field.to_string(),
        local: local.clone(),
        remote: remote.clone(),
        detected_at: now,
    })
}

fn unpark(conn: &Connection, record_id: &str, field: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM progress_conflicts WHERE record_id = ?1 AND field = ?2",
        params![record_id, field],
    )?;
    Ok(())
}

/// True if the record was never synced, or `at` is after the last sync.
fn changed_since(synced_at: Option<DateTime<Utc>>, at: DateTime<Utc>) -> bool {
    match synced_at {
        None => true,
        Some(synced) => at > synced,
    }
}

#[cfg(test)]
#[path = "conflict_tests.rs"]
mod tests;
