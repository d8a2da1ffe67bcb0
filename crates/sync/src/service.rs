// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Background drain loop.
//!
//! The service is the only consumer of the queue. It sleeps until something
//! can be done: a settled reconnect, new work, a backoff expiring, or
//! shutdown. Dispatch is fenced on the monitor's published state; an
//! offline transition stops new dequeues but lets calls already in flight
//! finish within their timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xs_core::clock::until;
use xs_core::{
    CacheManager, ClockSource, ConflictResolver, DownloadLedger, Error, FailOutcome, Failure,
    ProgressRecord, QueueManager, SyncItem, SyncPayload,
};

use crate::handler::{Ack, HandlerError, HandlerRegistry, HandlerResult, SyncHandler};
use crate::network::{NetworkMonitor, StatusChange};

pub type ProgressFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<ProgressRecord>, HandlerError>> + Send + 'a>>;

/// Embedder-side access to mutable progress state, reconciled on reconnect.
pub trait ProgressSync: Send + Sync {
    /// Records changed locally since their last sync.
    fn local_records(&self) -> Vec<ProgressRecord>;

    /// The server's versions of the given records.
    fn remote_records<'a>(&'a self, record_ids: &'a [String]) -> ProgressFuture<'a>;

    /// Persist merged records locally.
    fn store_merged(&self, merged: &[ProgressRecord]);
}

/// Counters since the service was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Drain passes that dispatched at least one item.
    pub drains_started: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Outcomes dropped because the item was requeued mid-flight.
    pub discarded: u64,
}

#[derive(Default)]
struct StatCounters {
    drains_started: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncStats {
        SyncStats {
            drains_started: self.drains_started.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SyncService {
    queue: Arc<QueueManager>,
    cache: Arc<CacheManager>,
    downloads: Arc<DownloadLedger>,
    monitor: Arc<NetworkMonitor>,
    handlers: HandlerRegistry,
    conflicts: Arc<ConflictResolver>,
    progress: Option<Arc<dyn ProgressSync>>,
    call_timeout: Duration,
    device_id: String,
    clock: Arc<dyn ClockSource>,
    stats: StatCounters,
}

impl SyncService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueManager>,
        cache: Arc<CacheManager>,
        downloads: Arc<DownloadLedger>,
        monitor: Arc<NetworkMonitor>,
        handlers: HandlerRegistry,
        conflicts: Arc<ConflictResolver>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        SyncService {
            queue,
            cache,
            downloads,
            monitor,
            handlers,
            conflicts,
            progress: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            device_id: String::new(),
            clock,
            stats: StatCounters::default(),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSync>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot()
    }

    /// Drain until cancelled, then return claimed items to the queue.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut events = self.monitor.subscribe();
        let notify = self.queue.notifier();
        info!(handlers_registered = !self.handlers.is_empty(), "sync service started");

        if self.monitor.get_status().is_connected() {
            self.on_reconnect(&cancel).await;
        }

        loop {
            // Backoff timers only matter while dispatch is possible; a
            // reconnect event wakes the loop otherwise.
            let retry_in = if self.monitor.get_status().is_connected() {
                self.queue
                    .next_due_at()
                    .map(|at| until(self.clock.now(), at))
            } else {
                None
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(change) => self.on_status_change(change, &cancel).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed connectivity events");
                        if self.monitor.get_status().is_connected() {
                            self.on_reconnect(&cancel).await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = notify.notified() => {
                    self.drain(&cancel).await;
                }
                _ = sleep_for(retry_in) => {
                    self.drain(&cancel).await;
                }
            }
        }

        match self.queue.release_all_in_progress() {
            Ok(0) => {}
            Ok(n) => info!(released = n, "returned in-flight items to the queue"),
            Err(e) => error!(error = %e, "failed to release in-flight items"),
        }
        info!("sync service stopped");
    }

    async fn on_status_change(&self, change: StatusChange, cancel: &CancellationToken) {
        if change.is_reconnect() {
            self.on_reconnect(cancel).await;
        } else if !change.new.is_connected() {
            debug!(depth = self.queue.queue_depth(None), "offline; dispatch fenced");
        }
    }

    async fn on_reconnect(&self, cancel: &CancellationToken) {
        self.refresh_cache();
        self.reconcile_progress(cancel).await;
        self.drain(cancel).await;
    }

    fn refresh_cache(&self) {
        match self.cache.refresh_due() {
            Ok(ids) if !ids.is_empty() => debug!(requested = ids.len(), "cache refresh queued"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cache refresh check failed"),
        }
    }

    async fn reconcile_progress(&self, cancel: &CancellationToken) {
        let Some(progress) = &self.progress else {
            return;
        };
        let local = progress.local_records();
        if local.is_empty() {
            return;
        }
        let ids: Vec<String> = local.iter().map(|r| r.record_id.clone()).collect();

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(self.call_timeout, progress.remote_records(&ids)) => r,
        };
        let remote = match fetched {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                warn!(error = %e, "progress fetch failed");
                return;
            }
            Err(_) => {
                warn!(timeout = ?self.call_timeout, "progress fetch timed out");
                return;
            }
        };

        let report = match self.conflicts.reconcile(&local, &remote) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "progress reconcile failed");
                return;
            }
        };
        progress.store_merged(&report.merged);
        info!(
            records = report.merged.len(),
            local_wins = report.local_wins,
            remote_wins = report.remote_wins,
            "progress reconciled"
        );
        if !report.conflicts.is_empty() {
            warn!(count = report.conflicts.len(), "progress conflicts need resolution");
        }
    }

    /// Dispatch ready items until the queue is empty, connectivity drops, or
    /// shutdown. Returns how many items were dispatched.
    ///
    /// The cache refresh check runs afterwards only when something was
    /// delivered, so a run of failures never feeds itself new work.
    pub async fn drain(&self, cancel: &CancellationToken) -> usize {
        let mut dispatched = 0;
        let delivered_before = self.stats.delivered.load(Ordering::Relaxed);
        loop {
            if cancel.is_cancelled() || !self.monitor.get_status().is_connected() {
                break;
            }
            let limit = self.monitor.link_quality().batch_size();
            let run = match self.queue.dequeue_run(limit) {
                Ok(run) => run,
                Err(e) => {
                    error!(error = %e, "dequeue failed");
                    break;
                }
            };
            if run.is_empty() {
                break;
            }
            if dispatched == 0 {
                StatCounters::bump(&self.stats.drains_started);
                info!(
                    status = %self.monitor.get_status(),
                    quality = %self.monitor.link_quality(),
                    depth = self.queue.queue_depth(None) + run.len(),
                    "drain started"
                );
            }
            dispatched += run.len();
            if !self.dispatch_run(run, cancel).await {
                break;
            }
        }

        if dispatched > 0 {
            info!(
                dispatched,
                remaining = self.queue.queue_depth(None),
                "drain finished"
            );
            if self.stats.delivered.load(Ordering::Relaxed) > delivered_before {
                self.refresh_cache();
            }
        }
        dispatched
    }

    /// Deliver a claimed run of same-kind items. Returns false when the
    /// drain should stop.
    async fn dispatch_run(&self, items: Vec<SyncItem>, cancel: &CancellationToken) -> bool {
        let Some(first) = items.first() else {
            return true;
        };
        let kind = first.kind();
        let Some(handler) = self.handlers.get(kind) else {
            for item in &items {
                let failure = HandlerError::Terminal(format!("no handler registered for {kind}"));
                self.settle(item, Err(failure));
            }
            return true;
        };

        let chunk_size = handler.batch_limit().max(1);
        let mut offset = 0;
        for chunk in items.chunks(chunk_size) {
            if !self.monitor.get_status().is_connected() {
                self.release(&items[offset..]);
                return false;
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    self.release(&items[offset..]);
                    return false;
                }
                r = tokio::time::timeout(self.call_timeout, call(handler.as_ref(), chunk)) => r,
            };

            match outcome {
                Ok(results) => {
                    let mut results = results.into_iter();
                    for item in chunk {
                        let result = results.next().unwrap_or_else(|| {
                            Err(HandlerError::Retryable("handler returned no result".to_string()))
                        });
                        self.settle(item, result);
                    }
                }
                Err(_) => {
                    let message = format!("remote call timed out after {:?}", self.call_timeout);
                    for item in chunk {
                        self.settle(item, Err(HandlerError::Retryable(message.clone())));
                    }
                }
            }
            offset += chunk.len();
        }
        true
    }

    fn settle(&self, item: &SyncItem, result: HandlerResult) {
        match result {
            Ok(ack) => match self.apply_ack(item, ack) {
                Ok(()) => self.complete(item),
                Err(e) => self.fail(item, Failure::retryable(format!("applying result: {e}"))),
            },
            Err(e) => self.fail(item, e.into_failure()),
        }
    }

    /// Update the owning component before the item is removed.
    fn apply_ack(&self, item: &SyncItem, ack: Ack) -> xs_core::Result<()> {
        match ack {
            Ack::ContentFetched { key, questions } => {
                self.cache.apply_refresh(key, questions)?;
            }
            Ack::ContentUnavailable { key } => {
                self.cache.mark_unavailable(&key)?;
            }
            Ack::Delivered => match &item.payload {
                SyncPayload::DownloadStart(start) => {
                    self.downloads.start(
                        &start.content_id,
                        &self.device_id,
                        start.resume,
                        start.requested_at,
                    )?;
                }
                SyncPayload::DownloadStatusUpdate(update) => {
                    if !self.downloads.apply_update(update, &self.device_id)? {
                        debug!(content_id = %update.content_id, "stale download status ignored");
                    }
                }
                _ => {}
            },
        }
        Ok(())
    }

    fn complete(&self, item: &SyncItem) {
        match self.queue.mark_complete(&item.id) {
            Ok(()) => {
                StatCounters::bump(&self.stats.delivered);
                debug!(id = %item.id, kind = %item.kind(), "delivered");
            }
            Err(Error::NotInProgress(_)) => self.discard(item),
            Err(e) => error!(id = %item.id, error = %e, "failed to complete item"),
        }
    }

    fn fail(&self, item: &SyncItem, failure: Failure) {
        if let SyncPayload::ContentRefresh(refresh) = &item.payload {
            if let Some(key) = refresh.key() {
                if let Err(e) = self.cache.mark_needs_refresh(&key) {
                    warn!(%key, error = %e, "failed to flag cache entry");
                }
            }
        }

        match self.queue.mark_failed(&item.id, &failure) {
            Ok(FailOutcome::Retrying { .. }) => StatCounters::bump(&self.stats.retried),
            Ok(FailOutcome::DeadLettered) => StatCounters::bump(&self.stats.dead_lettered),
            Err(Error::NotInProgress(_)) => self.discard(item),
            Err(e) => error!(id = %item.id, error = %e, "failed to record failure"),
        }
    }

    fn discard(&self, item: &SyncItem) {
        StatCounters::bump(&self.stats.discarded);
        warn!(id = %item.id, "item was requeued during dispatch; result discarded");
    }

    fn release(&self, items: &[SyncItem]) {
        for item in items {
            if let Err(e) = self.queue.release(&item.id) {
                warn!(id = %item.id, error = %e, "failed to release item");
            }
        }
        if !items.is_empty() {
            debug!(count = items.len(), "released undispatched items");
        }
    }
}

async fn call(handler: &dyn SyncHandler, chunk: &[SyncItem]) -> Vec<HandlerResult> {
    match chunk {
        [item] => vec![handler.handle(item).await],
        _ => handler.handle_batch(chunk).await,
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
