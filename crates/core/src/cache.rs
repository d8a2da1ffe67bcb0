// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Local content cache keyed by (subject, level, year).
//!
//! Published entries are immutable. A refresh builds a new [`CacheEntry`],
//! persists it, then replaces the whole published map in one step, so a
//! reader holding the previous snapshot keeps a consistent view.
//!
//! Refreshes are requested by consumption progress: once the newest cached
//! year is mostly worked through, the next year is fetched.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::clock::ClockSource;
use crate::db::{self, format_timestamp, parse_timestamp};
use crate::error::Result;
use crate::item::ContentRefresh;

/// Identifies one cached unit of content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub subject: String,
    pub level: String,
    pub year: i32,
}

impl CacheKey {
    pub fn new(subject: impl Into<String>, level: impl Into<String>, year: i32) -> Self {
        CacheKey {
            subject: subject.into(),
            level: level.into(),
            year,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.subject, self.level, self.year)
    }
}

/// A single question as delivered by the content API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// SHA-256 hex digest of a question list's JSON form.
pub fn content_hash(questions: &[Question]) -> Result<String> {
    let bytes = serde_json::to_vec(questions)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// One published, immutable version of cached content.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    pub item_count: usize,
    pub questions: Arc<[Question]>,
    pub size_bytes: u64,
    /// Last fetch for this key failed; serve as-is and try again later.
    pub needs_refresh: bool,
}

impl CacheEntry {
    /// True when the hash and count describe the questions held.
    pub fn verify(&self) -> bool {
        self.item_count == self.questions.len()
            && content_hash(&self.questions).is_ok_and(|h| h == self.content_hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Nothing cached and nothing requested.
    Missing,
    Fresh,
    /// A fetch failed; the last good version is being served.
    NeedsRefresh,
    /// A refresh is queued or in flight.
    RefreshPending,
}

/// UI-facing summary for one subject/level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatus {
    pub freshness: Freshness,
    /// Completion of the newest cached year.
    pub completion_ratio: f64,
}

/// What the cache needs to know about queued work.
///
/// Implemented by [`QueueManager`](crate::queue::QueueManager); the cache
/// never touches queue state directly.
pub trait QueuePort: Send + Sync {
    /// A `ContentRefresh` for exactly this target is queued or in flight.
    fn pending_refresh(&self, subject: &str, level: &str, year: Option<i32>) -> bool;

    /// A `ContentRefresh` for this target was dead-lettered and is still held.
    ///
    /// Such a target is not requested again until the dead letter is retried
    /// or purged.
    fn refresh_dead_lettered(&self, subject: &str, level: &str, year: Option<i32>) -> bool;

    /// Answers for this key have not been delivered yet.
    fn has_unsynced_progress(&self, key: &CacheKey) -> bool;

    fn enqueue_refresh(&self, refresh: ContentRefresh) -> Result<String>;
}

/// Tuning knobs for refresh and eviction.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    /// Completion ratio of the newest year that triggers fetching the next.
    pub refresh_threshold: f64,
    /// On-disk budget for cached content.
    pub max_bytes: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            refresh_threshold: 0.75,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

type Snapshot = Arc<BTreeMap<CacheKey, Arc<CacheEntry>>>;

struct CacheStore {
    conn: Connection,
}

impl CacheStore {
    /// Load every stored entry, dropping rows that fail verification.
    fn load_entries(&self) -> Result<Vec<CacheEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject, level, year, content_hash, fetched_at, item_count, content,
                    size_bytes, needs_refresh
             FROM cache_entries",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                CacheKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get(2)?),
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, bool>(8)?,
            ))
        })?;

        let mut entries = Vec::new();
        let mut damaged = Vec::new();
        for row in rows {
            let (key, hash, fetched, count, content, size, needs_refresh) = row?;
            let decoded = serde_json::from_str::<Vec<Question>>(&content)
                .ok()
                .zip(parse_timestamp(&fetched, "fetched_at").ok());
            let Some((questions, fetched_at)) = decoded else {
                damaged.push(key);
                continue;
            };
            let entry = CacheEntry {
                key,
                content_hash: hash,
                fetched_at,
                item_count: usize::try_from(count).unwrap_or(0),
                questions: questions.into(),
                size_bytes: u64::try_from(size).unwrap_or(0),
                needs_refresh,
            };
            if entry.verify() {
                entries.push(entry);
            } else {
                damaged.push(entry.key);
            }
        }

        for key in damaged {
            warn!(key = %key, "dropping cache entry that failed verification");
            self.delete_entry(&key)?;
        }
        Ok(entries)
    }

    /// Persist a new version and clear any recorded gap for its key.
    fn upsert(&self, entry: &CacheEntry, content: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries
             (subject, level, year, content_hash, fetched_at, item_count, content, size_bytes, needs_refresh)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.key.subject,
                entry.key.level,
                entry.key.year,
                entry.content_hash,
                format_timestamp(&entry.fetched_at),
                entry.item_count as i64,
                content,
                entry.size_bytes as i64,
                entry.needs_refresh,
            ],
        )?;
        self.conn.execute(
            "DELETE FROM content_gaps WHERE subject = ?1 AND level = ?2 AND year = ?3",
            params![entry.key.subject, entry.key.level, entry.key.year],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn set_needs_refresh(&self, key: &CacheKey, value: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE cache_entries SET needs_refresh = ?4
             WHERE subject = ?1 AND level = ?2 AND year = ?3",
            params![key.subject, key.level, key.year, value],
        )?;
        Ok(())
    }

    fn delete_entry(&self, key: &CacheKey) -> Result<()> {
        self.conn.execute(
            "DELETE FROM cache_entries WHERE subject = ?1 AND level = ?2 AND year = ?3",
            params![key.subject, key.level, key.year],
        )?;
        Ok(())
    }

    fn consumed_ids(&self, key: &CacheKey) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT question_id FROM consumption WHERE subject = ?1 AND level = ?2 AND year = ?3",
        )?;
        let rows = stmt.query_map(params![key.subject, key.level, key.year], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<HashSet<String>, _>>()?)
    }

    fn record_consumption(&self, key: &CacheKey, question_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO consumption (subject, level, year, question_id, consumed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key.subject, key.level, key.year, question_id, format_timestamp(&at)],
        )?;
        Ok(())
    }

    fn last_consumed_at(&self, key: &CacheKey) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(consumed_at) FROM consumption
                 WHERE subject = ?1 AND level = ?2 AND year = ?3",
                params![key.subject, key.level, key.year],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(latest.and_then(|s| parse_timestamp(&s, "consumed_at").ok()))
    }

    fn add_gap(&self, key: &CacheKey, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO content_gaps (subject, level, year, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key.subject, key.level, key.year, format_timestamp(&at)],
        )?;
        Ok(())
    }

    fn has_gap(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM content_gaps WHERE subject = ?1 AND level = ?2 AND year = ?3",
            params![key.subject, key.level, key.year],
            |row| row.get(0),
        )?)
    }
}

/// Owns cached content and decides when to ask for more.
pub struct CacheManager {
    store: Mutex<CacheStore>,
    published: RwLock<Snapshot>,
    queue: Arc<dyn QueuePort>,
    policy: CachePolicy,
    clock: Arc<dyn ClockSource>,
}

impl CacheManager {
    /// Open the cache backed by the store file at `path`.
    pub fn open(
        path: &Path,
        queue: Arc<dyn QueuePort>,
        policy: CachePolicy,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self> {
        Self::with_connection(db::open_connection(path)?, queue, policy, clock)
    }

    pub fn with_connection(
        conn: Connection,
        queue: Arc<dyn QueuePort>,
        policy: CachePolicy,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self> {
        db::run_migrations(&conn)?;
        let store = CacheStore { conn };
        let entries: BTreeMap<_, _> = store
            .load_entries()?
            .into_iter()
            .map(|e| (e.key.clone(), Arc::new(e)))
            .collect();
        info!(entries = entries.len(), "cache loaded");

        Ok(CacheManager {
            store: Mutex::new(store),
            published: RwLock::new(Arc::new(entries)),
            queue,
            policy,
            clock,
        })
    }

    fn store(&self) -> MutexGuard<'_, CacheStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The currently published set of entries.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.published.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace the published map with an edited copy.
    fn publish(&self, edit: impl FnOnce(&mut BTreeMap<CacheKey, Arc<CacheEntry>>)) {
        let mut guard = self.published.write().unwrap_or_else(|e| e.into_inner());
        let mut next = BTreeMap::clone(&guard);
        edit(&mut next);
        *guard = Arc::new(next);
    }

    /// Cached years for a subject/level, oldest first. Never touches the network.
    pub fn get(&self, subject: &str, level: &str) -> Vec<Arc<CacheEntry>> {
        self.snapshot()
            .values()
            .filter(|e| e.key.subject == subject && e.key.level == level)
            .cloned()
            .collect()
    }

    pub fn entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.snapshot().get(key).cloned()
    }

    /// Share of the entry's questions that have been consumed.
    ///
    /// Zero when nothing is cached for `key`; one for an empty entry.
    pub fn completion_ratio(&self, key: &CacheKey) -> Result<f64> {
        let Some(entry) = self.entry(key) else {
            return Ok(0.0);
        };
        if entry.item_count == 0 {
            return Ok(1.0);
        }
        let consumed = self.store().consumed_ids(key)?;
        let done = entry
            .questions
            .iter()
            .filter(|q| consumed.contains(&q.id))
            .count();
        Ok(done as f64 / entry.item_count as f64)
    }

    /// Mark a question as worked through. Repeats are ignored.
    pub fn record_consumption(&self, key: &CacheKey, question_id: &str) -> Result<()> {
        self.store()
            .record_consumption(key, question_id, self.clock.now())
    }

    fn request(&self, subject: &str, level: &str, year: Option<i32>) -> Result<Option<String>> {
        if self.queue.pending_refresh(subject, level, year) {
            return Ok(None);
        }
        if self.queue.refresh_dead_lettered(subject, level, year) {
            debug!(subject, level, ?year, "refresh dead-lettered, not requesting again");
            return Ok(None);
        }
        let id = self.queue.enqueue_refresh(ContentRefresh {
            subject: subject.to_string(),
            level: level.to_string(),
            year,
        })?;
        debug!(subject, level, ?year, id = %id, "content refresh requested");
        Ok(Some(id))
    }

    /// Enqueue whatever fetches this subject/level currently warrants.
    ///
    /// - Nothing cached: fetch the latest content.
    /// - Entries flagged after a failed fetch: fetch them again.
    /// - Newest year at or past the threshold: fetch the following year,
    ///   unless the server already said it does not exist.
    ///
    /// Each target is enqueued at most once while a fetch for it is queued
    /// or in flight. Returns the ids of newly enqueued items.
    pub fn maybe_refresh(&self, subject: &str, level: &str) -> Result<Vec<String>> {
        let entries = self.get(subject, level);
        let mut enqueued = Vec::new();

        let Some(latest) = entries.last() else {
            enqueued.extend(self.request(subject, level, None)?);
            return Ok(enqueued);
        };

        for entry in entries.iter().filter(|e| e.needs_refresh) {
            enqueued.extend(self.request(subject, level, Some(entry.key.year))?);
        }

        let ratio = self.completion_ratio(&latest.key)?;
        if ratio < self.policy.refresh_threshold {
            return Ok(enqueued);
        }

        let Some(next_year) = latest.key.year.checked_add(1) else {
            return Ok(enqueued);
        };
        let next = CacheKey::new(subject, level, next_year);
        if self.store().has_gap(&next)? {
            debug!(key = %next, "next year not published, skipping");
            return Ok(enqueued);
        }
        enqueued.extend(self.request(subject, level, Some(next.year))?);
        Ok(enqueued)
    }

    /// Run [`CacheManager::maybe_refresh`] for every cached subject/level.
    pub fn refresh_due(&self) -> Result<Vec<String>> {
        let pairs: BTreeSet<(String, String)> = self
            .snapshot()
            .keys()
            .map(|k| (k.subject.clone(), k.level.clone()))
            .collect();

        let mut enqueued = Vec::new();
        for (subject, level) in pairs {
            enqueued.extend(self.maybe_refresh(&subject, &level)?);
        }
        Ok(enqueued)
    }

    /// Publish freshly fetched content for `key`.
    pub fn apply_refresh(&self, key: CacheKey, questions: Vec<Question>) -> Result<Arc<CacheEntry>> {
        let content = serde_json::to_string(&questions)?;
        let entry = Arc::new(CacheEntry {
            content_hash: content_hash(&questions)?,
            fetched_at: self.clock.now(),
            item_count: questions.len(),
            size_bytes: content.len() as u64,
            questions: questions.into(),
            needs_refresh: false,
            key,
        });

        {
            let store = self.store();
            store.upsert(&entry, &content)?;
            self.publish(|map| {
                map.insert(entry.key.clone(), Arc::clone(&entry));
            });
        }
        info!(key = %entry.key, items = entry.item_count, "cache entry refreshed");

        self.evict_to_budget()?;
        Ok(entry)
    }

    /// Flag an entry after a failed fetch. The current version keeps serving.
    ///
    /// Returns false when nothing is cached for `key`.
    pub fn mark_needs_refresh(&self, key: &CacheKey) -> Result<bool> {
        let store = self.store();
        let Some(current) = self.entry(key) else {
            return Ok(false);
        };
        if current.needs_refresh {
            return Ok(true);
        }

        store.set_needs_refresh(key, true)?;
        let flagged = Arc::new(CacheEntry {
            needs_refresh: true,
            ..CacheEntry::clone(&current)
        });
        self.publish(|map| {
            map.insert(key.clone(), flagged);
        });
        warn!(key = %key, "cache entry marked for refresh");
        Ok(true)
    }

    /// Remember that the server has no content for `key`.
    pub fn mark_unavailable(&self, key: &CacheKey) -> Result<()> {
        self.store().add_gap(key, self.clock.now())?;
        info!(key = %key, "content not available yet");
        Ok(())
    }

    pub fn cache_status(&self, subject: &str, level: &str) -> Result<CacheStatus> {
        let entries = self.get(subject, level);
        let completion_ratio = match entries.last() {
            Some(latest) => self.completion_ratio(&latest.key)?,
            None => 0.0,
        };

        let mut targets: Vec<Option<i32>> = vec![None];
        targets.extend(entries.iter().map(|e| Some(e.key.year)));
        targets.extend(entries.last().and_then(|e| e.key.year.checked_add(1)).map(Some));
        let pending = targets
            .into_iter()
            .any(|year| self.queue.pending_refresh(subject, level, year));

        let freshness = if pending {
            Freshness::RefreshPending
        } else if entries.is_empty() {
            Freshness::Missing
        } else if entries.iter().any(|e| e.needs_refresh) {
            Freshness::NeedsRefresh
        } else {
            Freshness::Fresh
        };

        Ok(CacheStatus {
            freshness,
            completion_ratio,
        })
    }

    /// Total size of published content.
    pub fn size_bytes(&self) -> u64 {
        self.snapshot().values().map(|e| e.size_bytes).sum()
    }

    /// Evict least-recently-completed entries until under budget.
    ///
    /// Entries with undelivered answers are never evicted. Returns the
    /// evicted keys.
    pub fn evict_to_budget(&self) -> Result<Vec<CacheKey>> {
        let snapshot = self.snapshot();
        self.evict_from(&snapshot, self.policy.max_bytes)
    }

    /// Plan evictions against `snapshot`, then delete only the planned
    /// versions that are still the published ones.
    fn evict_from(&self, snapshot: &Snapshot, max_bytes: u64) -> Result<Vec<CacheKey>> {
        let mut total: u64 = snapshot.values().map(|e| e.size_bytes).sum();
        if total <= max_bytes {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(DateTime<Utc>, Arc<CacheEntry>)> = {
            let store = self.store();
            snapshot
                .values()
                .map(|e| {
                    let recency = store.last_consumed_at(&e.key)?.unwrap_or(e.fetched_at);
                    Ok((recency, Arc::clone(e)))
                })
                .collect::<Result<_>>()?
        };
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.key.cmp(&b.1.key)));

        let mut planned = Vec::new();
        for (_, entry) in candidates {
            if total <= max_bytes {
                break;
            }
            if self.queue.has_unsynced_progress(&entry.key) {
                continue;
            }
            total = total.saturating_sub(entry.size_bytes);
            planned.push(entry);
        }

        let mut victims = Vec::new();
        if !planned.is_empty() {
            let store = self.store();
            // Publishing happens under the store lock, so this view is final.
            let current = self.snapshot();
            for entry in planned {
                let unchanged = current
                    .get(&entry.key)
                    .is_some_and(|published| Arc::ptr_eq(published, &entry));
                if !unchanged {
                    debug!(key = %entry.key, "entry replaced since planning, keeping it");
                    continue;
                }
                store.delete_entry(&entry.key)?;
                victims.push(entry.key.clone());
            }
            self.publish(|map| {
                for key in &victims {
                    map.remove(key);
                }
            });
        }

        let remaining = self.size_bytes();
        if !victims.is_empty() {
            info!(evicted = victims.len(), remaining_bytes = remaining, "cache evicted to budget");
        }
        if remaining > max_bytes {
            warn!(
                remaining_bytes = remaining,
                budget = max_bytes,
                "cache still over budget after eviction"
            );
        }
        Ok(victims)
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
