// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Priority-ordered durable work queue.
//!
//! Every mutation is written to SQLite before the in-memory index changes,
//! so a crash never loses an acknowledged enqueue. The index is rebuilt from
//! the store on [`QueueManager::open`]:
//!
//! - `InProgress` rows left by a crash go back to `Pending`.
//! - Rows that no longer decode are dead-lettered with the decode error.
//! - Dead-lettered rows stay on disk but out of the index.
//!
//! Ordering is strict by tier (`T1` first), then FIFO by `created_at` with
//! the insertion sequence breaking ties.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::cache::{CacheKey, QueuePort};
use crate::clock::{to_delta, ClockSource};
use crate::db;
use crate::error::{Error, Result};
use crate::item::{
    ContentRefresh, DeadLetter, ErrorRecord, FailOutcome, Failure, ItemKind, ItemStatus,
    Priority, SyncItem, SyncPayload,
};
use crate::queue_store::{Loaded, QueueStore};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Priority,
    created_at: DateTime<Utc>,
    seq: i64,
    id: String,
}

impl ReadyKey {
    fn of(item: &SyncItem) -> Self {
        ReadyKey {
            priority: item.priority,
            created_at: item.created_at,
            seq: item.seq,
            id: item.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct WaitKey {
    due: DateTime<Utc>,
    seq: i64,
    id: String,
}

struct QueueInner {
    store: QueueStore,
    /// Every live (not dead-lettered) item.
    items: HashMap<String, SyncItem>,
    /// Pending items in dequeue order.
    ready: BTreeSet<ReadyKey>,
    /// Failed items by retry time.
    waiting: BTreeSet<WaitKey>,
}

impl QueueInner {
    fn new(store: QueueStore) -> Self {
        QueueInner {
            store,
            items: HashMap::new(),
            ready: BTreeSet::new(),
            waiting: BTreeSet::new(),
        }
    }

    /// Replace an item's in-memory state and index entry.
    fn put(&mut self, item: SyncItem) {
        self.unindex(&item.id);
        match item.status {
            ItemStatus::Pending => {
                self.ready.insert(ReadyKey::of(&item));
            }
            ItemStatus::Failed => {
                let due = item.next_retry_at.unwrap_or(item.created_at);
                self.waiting.insert(WaitKey {
                    due,
                    seq: item.seq,
                    id: item.id.clone(),
                });
            }
            ItemStatus::InProgress => {}
            ItemStatus::Completed | ItemStatus::DeadLetter => {
                self.items.remove(&item.id);
                return;
            }
        }
        self.items.insert(item.id.clone(), item);
    }

    fn unindex(&mut self, id: &str) {
        let Some(old) = self.items.get(id) else {
            return;
        };
        match old.status {
            ItemStatus::Pending => {
                self.ready.remove(&ReadyKey::of(old));
            }
            ItemStatus::Failed => {
                let key = WaitKey {
                    due: old.next_retry_at.unwrap_or(old.created_at),
                    seq: old.seq,
                    id: old.id.clone(),
                };
                self.waiting.remove(&key);
            }
            _ => {}
        }
    }

    /// Look up an item that must currently be claimed.
    fn in_progress(&self, id: &str) -> Result<&SyncItem> {
        match self.items.get(id) {
            Some(item) if item.status == ItemStatus::InProgress => Ok(item),
            Some(_) => Err(Error::NotInProgress(id.to_string())),
            None => match self.store.status_of(id) {
                Ok(Some(_)) => Err(Error::NotInProgress(id.to_string())),
                _ => Err(Error::ItemNotFound(id.to_string())),
            },
        }
    }

    /// Move Failed items whose retry time has passed back to Pending.
    fn promote_due(&mut self, now: DateTime<Utc>) -> Result<()> {
        let due: Vec<SyncItem> = self
            .waiting
            .iter()
            .take_while(|k| k.due <= now)
            .filter_map(|k| self.items.get(&k.id))
            .map(|item| SyncItem {
                status: ItemStatus::Pending,
                ..item.clone()
            })
            .collect();
        if due.is_empty() {
            return Ok(());
        }

        self.store.update_many(&due)?;
        for item in due {
            self.put(item);
        }
        Ok(())
    }

    /// Claim the given ready items in one transaction.
    fn claim(&mut self, keys: Vec<ReadyKey>, now: DateTime<Utc>) -> Result<Vec<SyncItem>> {
        let claimed: Vec<SyncItem> = keys
            .iter()
            .filter_map(|k| self.items.get(&k.id))
            .map(|item| SyncItem {
                status: ItemStatus::InProgress,
                last_attempt_at: Some(now),
                ..item.clone()
            })
            .collect();
        if claimed.is_empty() {
            return Ok(claimed);
        }

        self.store.update_many(&claimed)?;
        for item in &claimed {
            self.put(item.clone());
        }
        Ok(claimed)
    }
}

/// Durable priority queue of [`SyncItem`]s.
///
/// Safe to share across threads; producers and the drain loop may call it
/// concurrently.
pub struct QueueManager {
    inner: Mutex<QueueInner>,
    policy: BackoffPolicy,
    clock: Arc<dyn ClockSource>,
    notify: Arc<Notify>,
}

impl QueueManager {
    /// Open the queue backed by the store file at `path`.
    pub fn open(path: &Path, policy: BackoffPolicy, clock: Arc<dyn ClockSource>) -> Result<Self> {
        let conn = db::open_connection(path)?;
        Self::with_connection(conn, policy, clock)
    }

    /// Build the queue on an already-open connection and rebuild the index.
    pub fn with_connection(
        conn: rusqlite::Connection,
        policy: BackoffPolicy,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self> {
        db::run_migrations(&conn)?;
        let mut inner = QueueInner::new(QueueStore::new(conn));
        let now = clock.now();

        let mut recovered = 0usize;
        let mut quarantined = 0usize;
        for loaded in inner.store.load_all()? {
            match loaded {
                Loaded::Item(mut item) => {
                    match item.status {
                        ItemStatus::DeadLetter => continue,
                        ItemStatus::Completed => {
                            inner.store.delete(&item.id)?;
                            continue;
                        }
                        ItemStatus::InProgress => {
                            item.status = ItemStatus::Pending;
                            inner.store.update(&item)?;
                            recovered += 1;
                        }
                        ItemStatus::Failed if item.next_retry_at.is_none() => {
                            item.status = ItemStatus::Pending;
                            inner.store.update(&item)?;
                        }
                        ItemStatus::Pending | ItemStatus::Failed => {}
                    }
                    inner.put(item);
                }
                Loaded::Unreadable { id, reason } => {
                    let already_dead = matches!(
                        inner.store.status_of(&id),
                        Ok(Some(ItemStatus::DeadLetter))
                    );
                    if !already_dead {
                        warn!(id = %id, reason = %reason, "dead-lettering unreadable queue row");
                        inner.store.mark_unreadable(&id, &reason, now)?;
                        quarantined += 1;
                    }
                }
            }
        }

        info!(
            items = inner.items.len(),
            recovered, quarantined, "queue index rebuilt"
        );

        Ok(QueueManager {
            inner: Mutex::new(inner),
            policy,
            clock,
            notify: Arc::new(Notify::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wakes the drain loop whenever new work becomes ready.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Durably add an item, returning its id.
    pub fn enqueue(&self, payload: SyncPayload, priority: Priority) -> Result<String> {
        let mut item = SyncItem {
            id: Uuid::now_v7().to_string(),
            payload,
            priority,
            status: ItemStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
            created_at: self.clock.now(),
            seq: 0,
        };

        {
            let mut inner = self.lock();
            item.seq = inner.store.insert(&item)?;
            debug!(id = %item.id, kind = %item.kind(), priority = %priority, "enqueued");
            inner.put(item.clone());
        }
        self.notify.notify_one();
        Ok(item.id)
    }

    /// Claim the oldest ready item in the highest non-empty tier.
    pub fn dequeue_next(&self) -> Result<Option<SyncItem>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.promote_due(now)?;

        let Some(key) = inner.ready.first().cloned() else {
            return Ok(None);
        };
        Ok(inner.claim(vec![key], now)?.into_iter().next())
    }

    /// Claim up to `limit` ready items of one kind, in dequeue order.
    pub fn dequeue_batch(&self, kind: ItemKind, limit: usize) -> Result<Vec<SyncItem>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.promote_due(now)?;

        let keys: Vec<ReadyKey> = inner
            .ready
            .iter()
            .filter(|k| inner.items.get(&k.id).is_some_and(|i| i.kind() == kind))
            .take(limit)
            .cloned()
            .collect();
        inner.claim(keys, now)
    }

    /// Claim the head of the queue plus the same-kind items directly behind it.
    ///
    /// Stops at the first ready item of another kind, so batching never lets
    /// an item overtake one that would have been dequeued before it.
    pub fn dequeue_run(&self, limit: usize) -> Result<Vec<SyncItem>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.promote_due(now)?;

        let mut kinds = inner
            .ready
            .iter()
            .filter_map(|k| inner.items.get(&k.id).map(|i| (k, i.kind())));
        let Some((head, kind)) = kinds.next() else {
            return Ok(Vec::new());
        };
        let mut keys = vec![head.clone()];
        keys.extend(
            kinds
                .take_while(|(_, k)| *k == kind)
                .take(limit.saturating_sub(1))
                .map(|(key, _)| key.clone()),
        );
        inner.claim(keys, now)
    }

    /// Ready items of one kind, in dequeue order, without claiming them.
    pub fn peek_batch(&self, kind: ItemKind, limit: usize) -> Result<Vec<SyncItem>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.promote_due(now)?;

        Ok(inner
            .ready
            .iter()
            .filter_map(|k| inner.items.get(&k.id))
            .filter(|i| i.kind() == kind)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Remove a delivered item from the store.
    pub fn mark_complete(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.in_progress(id)?;
        inner.store.delete(id)?;
        inner.unindex(id);
        inner.items.remove(id);
        debug!(id, "completed");
        Ok(())
    }

    /// Record a failed attempt and schedule a retry or dead-letter the item.
    pub fn mark_failed(&self, id: &str, failure: &Failure) -> Result<FailOutcome> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let mut next = inner.in_progress(id)?.clone();
        next.attempt_count += 1;

        let record = ErrorRecord {
            attempt: next.attempt_count,
            message: failure.message.clone(),
            retryable: failure.retryable,
            failed_at: now,
        };

        if !failure.retryable || self.policy.exhausted(next.attempt_count) {
            next.status = ItemStatus::DeadLetter;
            next.next_retry_at = None;
            inner.store.fail(&next, &record)?;
            inner.put(next);
            error!(
                id,
                attempts = record.attempt,
                retryable = failure.retryable,
                error = %failure.message,
                "dead-lettered"
            );
            return Ok(FailOutcome::DeadLettered);
        }

        let due = now + to_delta(self.policy.delay_for_attempt(next.attempt_count));
        next.status = ItemStatus::Failed;
        next.next_retry_at = Some(due);
        inner.store.fail(&next, &record)?;
        inner.put(next);
        warn!(
            id,
            attempts = record.attempt,
            retry_at = %due,
            error = %failure.message,
            "attempt failed, will retry"
        );
        Ok(FailOutcome::Retrying { next_retry_at: due })
    }

    /// Return a claimed item to Pending without counting an attempt.
    pub fn release(&self, id: &str) -> Result<()> {
        {
            let mut inner = self.lock();
            let item = SyncItem {
                status: ItemStatus::Pending,
                ..inner.in_progress(id)?.clone()
            };
            inner.store.update(&item)?;
            inner.put(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Return every claimed item to Pending. Used on shutdown.
    pub fn release_all_in_progress(&self) -> Result<usize> {
        let released = {
            let mut inner = self.lock();
            let items: Vec<SyncItem> = inner
                .items
                .values()
                .filter(|i| i.status == ItemStatus::InProgress)
                .map(|i| SyncItem {
                    status: ItemStatus::Pending,
                    ..i.clone()
                })
                .collect();
            inner.store.update_many(&items)?;
            let count = items.len();
            for item in items {
                inner.put(item);
            }
            count
        };
        if released > 0 {
            info!(released, "returned in-progress items to pending");
            self.notify.notify_one();
        }
        Ok(released)
    }

    /// Number of live items, optionally restricted to one tier.
    pub fn queue_depth(&self, priority: Option<Priority>) -> usize {
        let inner = self.lock();
        inner
            .items
            .values()
            .filter(|i| match priority {
                Some(p) => i.priority == p,
                None => true,
            })
            .count()
    }

    /// Look up an item by id, including dead-lettered ones.
    pub fn get(&self, id: &str) -> Result<Option<SyncItem>> {
        let inner = self.lock();
        if let Some(item) = inner.items.get(id) {
            return Ok(Some(item.clone()));
        }
        inner.store.get(id)
    }

    /// Earliest retry time among items waiting out their backoff.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.lock().waiting.first().map(|k| k.due)
    }

    /// Dead-lettered items with their error history.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.lock().store.dead_letters()
    }

    /// Re-queue a dead-lettered item with a fresh attempt budget.
    pub fn retry_dead_letter(&self, id: &str) -> Result<()> {
        {
            let mut inner = self.lock();
            match inner.store.status_of(id)? {
                Some(ItemStatus::DeadLetter) => {}
                Some(_) => return Err(Error::NotDeadLettered(id.to_string())),
                None => return Err(Error::ItemNotFound(id.to_string())),
            }
            let Some(mut item) = inner.store.get(id)? else {
                return Err(Error::ItemNotFound(id.to_string()));
            };
            item.status = ItemStatus::Pending;
            item.attempt_count = 0;
            item.next_retry_at = None;
            inner.store.update(&item)?;
            info!(id, "dead letter re-queued");
            inner.put(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Permanently delete a dead-lettered item and its history.
    pub fn purge_dead_letter(&self, id: &str) -> Result<()> {
        let inner = self.lock();
        match inner.store.status_of(id)? {
            Some(ItemStatus::DeadLetter) => {
                inner.store.delete(id)?;
                Ok(())
            }
            Some(_) => Err(Error::NotDeadLettered(id.to_string())),
            None => Err(Error::ItemNotFound(id.to_string())),
        }
    }
}

impl QueuePort for QueueManager {
    fn pending_refresh(&self, subject: &str, level: &str, year: Option<i32>) -> bool {
        self.lock().items.values().any(|i| {
            matches!(&i.payload, SyncPayload::ContentRefresh(r)
                if r.subject == subject && r.level == level && r.year == year)
        })
    }

    fn refresh_dead_lettered(&self, subject: &str, level: &str, year: Option<i32>) -> bool {
        match self.lock().store.dead_payloads(ItemKind::ContentRefresh) {
            Ok(payloads) => payloads.iter().any(|p| {
                matches!(p, SyncPayload::ContentRefresh(r)
                    if r.subject == subject && r.level == level && r.year == year)
            }),
            Err(e) => {
                warn!(error = %e, "failed to read dead-lettered refreshes");
                false
            }
        }
    }

    fn has_unsynced_progress(&self, key: &CacheKey) -> bool {
        self.lock().items.values().any(|i| {
            matches!(&i.payload, SyncPayload::AnswerSubmission(a) if &a.key == key)
        })
    }

    fn enqueue_refresh(&self, refresh: ContentRefresh) -> Result<String> {
        self.enqueue(SyncPayload::ContentRefresh(refresh), Priority::T2)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
