// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::handler::{BatchFuture, HandlerFuture};
use crate::network::{MonitorSettings, Probe, ProbeError, ProbeFuture};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use xs_core::{
    db, BackoffPolicy, CacheKey, CachePolicy, CloudAnalysisRequest, ContentRefresh, DownloadStart,
    DownloadStatus, DownloadStatusUpdate, FieldValue, ItemKind, ItemStatus, ManualClock, Priority,
    Question,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap()
}

struct SwitchProbe(AtomicBool);

impl Probe for SwitchProbe {
    fn probe(&self) -> ProbeFuture<'_> {
        let up = self.0.load(Ordering::SeqCst);
        Box::pin(async move {
            if up {
                Ok(Duration::from_millis(10))
            } else {
                Err(ProbeError::Unreachable("down".to_string()))
            }
        })
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
    batches: Mutex<Vec<usize>>,
    script: Mutex<VecDeque<HandlerResult>>,
    batch_limit: usize,
    delay: Duration,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Recorder {
            batch_limit: 1,
            ..Default::default()
        })
    }

    fn scripted(results: Vec<HandlerResult>) -> Arc<Self> {
        Arc::new(Recorder {
            batch_limit: 1,
            script: Mutex::new(results.into()),
            ..Default::default()
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Recorder {
            batch_limit: 1,
            delay,
            ..Default::default()
        })
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

impl SyncHandler for Recorder {
    fn handle<'a>(&'a self, item: &'a SyncItem) -> HandlerFuture<'a> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen.lock().unwrap().push(item.id.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Ack::Delivered))
        })
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }

    fn handle_batch<'a>(&'a self, items: &'a [SyncItem]) -> BatchFuture<'a> {
        self.batches.lock().unwrap().push(items.len());
        Box::pin(async move {
            let mut out = Vec::new();
            for item in items {
                out.push(self.handle(item).await);
            }
            out
        })
    }
}

struct Fixture {
    clock: Arc<ManualClock>,
    queue: Arc<QueueManager>,
    cache: Arc<CacheManager>,
    downloads: Arc<DownloadLedger>,
    monitor: Arc<NetworkMonitor>,
    probe: Arc<SwitchProbe>,
    conflicts: Arc<ConflictResolver>,
    cancel: CancellationToken,
}

impl Fixture {
    fn service(&self, handlers: HandlerRegistry) -> SyncService {
        SyncService::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.cache),
            Arc::clone(&self.downloads),
            Arc::clone(&self.monitor),
            handlers,
            Arc::clone(&self.conflicts),
            self.clock.clone(),
        )
        .with_device_id("dev-1")
    }

    fn analysis(&self, tag: &str, priority: Priority) -> String {
        let payload = SyncPayload::CloudAnalysisRequest(CloudAnalysisRequest {
            history_id: tag.to_string(),
            question: "q".into(),
            answer: "a".into(),
            local_feedback: "f".into(),
        });
        self.queue.enqueue(payload, priority).unwrap()
    }

    fn status(&self, id: &str) -> Option<ItemStatus> {
        self.queue.get(id).unwrap().map(|i| i.status)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn fixture(online: bool) -> Fixture {
    let clock = Arc::new(ManualClock::new(t0()));
    let queue = Arc::new(
        QueueManager::with_connection(
            db::open_in_memory().unwrap(),
            BackoffPolicy::default(),
            clock.clone(),
        )
        .unwrap(),
    );
    let cache = Arc::new(
        CacheManager::with_connection(
            db::open_in_memory().unwrap(),
            queue.clone(),
            CachePolicy::default(),
            clock.clone(),
        )
        .unwrap(),
    );
    let downloads = Arc::new(DownloadLedger::with_connection(db::open_in_memory().unwrap()).unwrap());
    let probe = Arc::new(SwitchProbe(AtomicBool::new(online)));
    let settings = MonitorSettings {
        settle_window: Duration::ZERO,
        ..MonitorSettings::default()
    };
    let monitor = Arc::new(NetworkMonitor::new(probe.clone(), settings));
    let conflicts = Arc::new(
        ConflictResolver::with_connection(
            db::open_in_memory().unwrap(),
            Duration::from_secs(60),
            clock.clone(),
        )
        .unwrap(),
    );
    let cancel = CancellationToken::new();

    tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let cancel = cancel.clone();
        async move { monitor.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(monitor.get_status().is_connected(), online);

    Fixture {
        clock,
        queue,
        cache,
        downloads,
        monitor,
        probe,
        conflicts,
        cancel,
    }
}

fn only(kind: ItemKind, handler: Arc<Recorder>) -> HandlerRegistry {
    HandlerRegistry::new().with(kind, handler)
}

#[tokio::test(start_paused = true)]
async fn drain_follows_priority_then_fifo() {
    let f = fixture(true).await;
    let handler = Recorder::new();
    let service = f.service(only(ItemKind::CloudAnalysisRequest, handler.clone()));

    let a = f.analysis("a", Priority::T1);
    let b = f.analysis("b", Priority::T3);
    let c = f.analysis("c", Priority::T1);

    assert_eq!(service.drain(&f.cancel).await, 3);
    assert_eq!(handler.seen(), vec![a, c, b]);
    assert_eq!(f.queue.queue_depth(None), 0);

    let stats = service.stats();
    assert_eq!(stats.drains_started, 1);
    assert_eq!(stats.delivered, 3);
}

#[tokio::test(start_paused = true)]
async fn drain_is_fenced_while_offline() {
    let f = fixture(false).await;
    let handler = Recorder::new();
    let service = f.service(only(ItemKind::CloudAnalysisRequest, handler.clone()));
    let id = f.analysis("a", Priority::T1);

    assert_eq!(service.drain(&f.cancel).await, 0);
    assert!(handler.seen().is_empty());
    assert_eq!(f.status(&id), Some(ItemStatus::Pending));
    assert_eq!(service.stats().drains_started, 0);
}

#[tokio::test(start_paused = true)]
async fn retryable_error_schedules_backoff() {
    let f = fixture(true).await;
    let handler = Recorder::scripted(vec![Err(HandlerError::Retryable("503".into()))]);
    let service = f.service(only(ItemKind::CloudAnalysisRequest, handler));
    let id = f.analysis("a", Priority::T2);

    service.drain(&f.cancel).await;

    let item = f.queue.get(&id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.attempt_count, 1);
    assert!(item.next_retry_at.unwrap() > t0());
    assert_eq!(service.stats().retried, 1);
}

#[tokio::test(start_paused = true)]
async fn terminal_error_dead_letters() {
    let f = fixture(true).await;
    let handler = Recorder::scripted(vec![Err(HandlerError::Terminal("422".into()))]);
    let service = f.service(only(ItemKind::CloudAnalysisRequest, handler));
    let id = f.analysis("a", Priority::T2);

    service.drain(&f.cancel).await;

    let dead = f.queue.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].errors[0].message, "422");
    assert_eq!(service.stats().dead_lettered, 1);
}

#[tokio::test(start_paused = true)]
async fn missing_handler_dead_letters() {
    let f = fixture(true).await;
    let service = f.service(HandlerRegistry::new());
    f.analysis("a", Priority::T1);

    service.drain(&f.cancel).await;

    let dead = f.queue.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].errors[0].message.contains("no handler"));
}

#[tokio::test(start_paused = true)]
async fn slow_call_times_out_as_retryable() {
    let f = fixture(true).await;
    let handler = Recorder::slow(Duration::from_secs(60));
    let service = f
        .service(only(ItemKind::CloudAnalysisRequest, handler))
        .with_call_timeout(Duration::from_secs(5));
    let id = f.analysis("a", Priority::T1);

    service.drain(&f.cancel).await;

    let item = f.queue.get(&id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.attempt_count, 1);
    assert_eq!(service.stats().retried, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_mid_flight_returns_item_to_pending() {
    let f = fixture(true).await;
    let handler = Recorder::slow(Duration::from_secs(20));
    let service = Arc::new(f.service(only(ItemKind::CloudAnalysisRequest, handler.clone())));
    let id = f.analysis("a", Priority::T1);

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        async move { service.drain(&cancel).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.status(&id), Some(ItemStatus::InProgress));

    cancel.cancel();
    task.await.unwrap();
    let item = f.queue.get(&id).unwrap().unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(item.attempt_count, 0);
    assert!(handler.seen().is_empty());
}

#[tokio::test(start_paused = true)]
async fn good_link_batches_same_kind_items() {
    let f = fixture(true).await;
    let handler = Arc::new(Recorder {
        batch_limit: 2,
        ..Default::default()
    });
    let service = f.service(only(ItemKind::CloudAnalysisRequest, handler.clone()));
    for tag in ["a", "b", "c", "d", "e"] {
        f.analysis(tag, Priority::T2);
    }

    assert_eq!(service.drain(&f.cancel).await, 5);
    assert_eq!(*handler.batches.lock().unwrap(), vec![2, 2]);
    assert_eq!(handler.seen().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn content_ack_publishes_to_cache() {
    let f = fixture(true).await;
    let key = CacheKey::new("math", "hl", 2025);
    let questions = vec![
        Question {
            id: "q1".into(),
            body: json!({"text": "1+1"}),
        },
        Question {
            id: "q2".into(),
            body: json!({"text": "2+2"}),
        },
    ];
    let handler = Recorder::scripted(vec![Ok(Ack::ContentFetched {
        key: key.clone(),
        questions,
    })]);
    let service = f.service(only(ItemKind::ContentRefresh, handler));
    f.queue
        .enqueue(
            SyncPayload::ContentRefresh(ContentRefresh {
                subject: "math".into(),
                level: "hl".into(),
                year: Some(2025),
            }),
            Priority::T2,
        )
        .unwrap();

    service.drain(&f.cancel).await;

    let entry = f.cache.entry(&key).unwrap();
    assert_eq!(entry.item_count, 2);
    assert!(entry.verify());
    assert!(!entry.needs_refresh);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_serving_and_flags_entry() {
    let f = fixture(true).await;
    let key = CacheKey::new("bio", "sl", 2024);
    f.cache
        .apply_refresh(
            key.clone(),
            vec![Question {
                id: "q1".into(),
                body: json!(null),
            }],
        )
        .unwrap();
    let handler = Recorder::scripted(vec![Err(HandlerError::Retryable("502".into()))]);
    let service = f.service(only(ItemKind::ContentRefresh, handler));
    f.queue
        .enqueue(
            SyncPayload::ContentRefresh(ContentRefresh {
                subject: "bio".into(),
                level: "sl".into(),
                year: Some(2024),
            }),
            Priority::T2,
        )
        .unwrap();

    service.drain(&f.cancel).await;

    let entry = f.cache.entry(&key).unwrap();
    assert!(entry.needs_refresh);
    assert_eq!(entry.item_count, 1);
}

/// Rejects every fetch as a client error.
#[derive(Default)]
struct RejectingContent {
    calls: AtomicU64,
}

impl SyncHandler for RejectingContent {
    fn handle<'a>(&'a self, _item: &'a SyncItem) -> HandlerFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(HandlerError::Terminal("HTTP 400".into())) })
    }
}

#[tokio::test(start_paused = true)]
async fn rejected_next_year_fetch_is_dead_lettered_once() {
    let f = fixture(true).await;
    let key = CacheKey::new("chem", "hl", 2025);
    f.cache
        .apply_refresh(
            key.clone(),
            vec![Question {
                id: "q1".into(),
                body: json!(null),
            }],
        )
        .unwrap();
    f.cache.record_consumption(&key, "q1").unwrap();

    let handler = Arc::new(RejectingContent::default());
    let registry = HandlerRegistry::new().with(ItemKind::ContentRefresh, handler.clone());
    let service = Arc::new(f.service(registry));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.queue.dead_letters().unwrap().len(), 1);
    assert_eq!(f.queue.queue_depth(None), 0);
    assert!(f.cache.refresh_due().unwrap().is_empty());

    // A later reconnect checks the cache again without re-requesting.
    f.probe.0.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    f.probe.0.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(service.stats().dead_lettered, 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn later_download_status_wins_regardless_of_arrival() {
    let f = fixture(true).await;
    let handler = Recorder::new();
    let registry = HandlerRegistry::new()
        .with(ItemKind::DownloadStart, handler.clone())
        .with(ItemKind::DownloadStatusUpdate, handler);
    let service = f.service(registry);
    let at = |s: i64| t0() + chrono::TimeDelta::seconds(s);
    let update = |bytes: u64, s: i64| {
        SyncPayload::DownloadStatusUpdate(DownloadStatusUpdate {
            content_id: "pkg-1".into(),
            status: DownloadStatus::Paused,
            bytes_downloaded: bytes,
            error_message: None,
            reported_at: at(s),
        })
    };

    f.queue
        .enqueue(
            SyncPayload::DownloadStart(DownloadStart {
                content_id: "pkg-1".into(),
                resume: false,
                requested_at: at(0),
            }),
            Priority::T3,
        )
        .unwrap();
    f.queue.enqueue(update(800, 20), Priority::T3).unwrap();
    f.queue.enqueue(update(400, 10), Priority::T3).unwrap();

    service.drain(&f.cancel).await;

    let record = f.downloads.get("pkg-1").unwrap().unwrap();
    assert_eq!(record.bytes_downloaded, 800);
    assert_eq!(record.reported_at, at(20));
    assert_eq!(record.device_id, "dev-1");
}

#[tokio::test(start_paused = true)]
async fn run_wakes_on_enqueue_and_releases_on_shutdown() {
    let f = fixture(true).await;
    let handler = Recorder::slow(Duration::from_secs(10));
    let service = Arc::new(f.service(only(ItemKind::CloudAnalysisRequest, handler.clone())));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });

    let first = f.analysis("a", Priority::T1);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(handler.seen(), vec![first]);

    let second = f.analysis("b", Priority::T1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(f.status(&second), Some(ItemStatus::InProgress));

    cancel.cancel();
    task.await.unwrap();
    assert_eq!(f.status(&second), Some(ItemStatus::Pending));
}

#[tokio::test(start_paused = true)]
async fn run_retries_when_backoff_expires() {
    let f = fixture(true).await;
    let handler = Recorder::scripted(vec![Err(HandlerError::Retryable("503".into()))]);
    let service = Arc::new(f.service(only(ItemKind::CloudAnalysisRequest, handler.clone())));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });

    let id = f.analysis("a", Priority::T1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.status(&id), Some(ItemStatus::Failed));

    // The queue reads the manual clock; move it past the backoff before the
    // service's timer fires.
    f.clock.advance(Duration::from_secs(3));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(f.status(&id), None);
    assert_eq!(handler.seen().len(), 2);

    cancel.cancel();
    task.await.unwrap();
}

struct FakeProgress {
    local: Vec<ProgressRecord>,
    remote: Vec<ProgressRecord>,
    stored: Mutex<Vec<ProgressRecord>>,
}

impl ProgressSync for FakeProgress {
    fn local_records(&self) -> Vec<ProgressRecord> {
        self.local.clone()
    }

    fn remote_records<'a>(&'a self, _record_ids: &'a [String]) -> ProgressFuture<'a> {
        Box::pin(async move { Ok(self.remote.clone()) })
    }

    fn store_merged(&self, merged: &[ProgressRecord]) {
        self.stored.lock().unwrap().extend_from_slice(merged);
    }
}

fn progress(score: i64, at: i64) -> ProgressRecord {
    let mut fields = BTreeMap::new();
    fields.insert(
        "score".to_string(),
        FieldValue {
            value: json!(score),
            updated_at: t0() + chrono::TimeDelta::seconds(at),
        },
    );
    ProgressRecord {
        record_id: "hist-1".into(),
        fields,
        synced_at: None,
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_reconciles_progress() {
    let f = fixture(true).await;
    let progress = Arc::new(FakeProgress {
        local: vec![progress(3, 10)],
        remote: vec![progress(7, 500)],
        stored: Mutex::new(Vec::new()),
    });
    let service = Arc::new(f.service(HandlerRegistry::new()).with_progress(progress.clone()));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        async move { service.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = progress.stored.lock().unwrap().clone();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].fields["score"].value, json!(7));
    assert!(f.conflicts.pending_conflicts().unwrap().is_empty());

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn offline_transition_stops_dispatch_after_in_flight_call() {
    let f = fixture(true).await;
    let handler = Recorder::slow(Duration::from_secs(2));
    let service = Arc::new(f.service(only(ItemKind::CloudAnalysisRequest, handler.clone())));
    let a = f.analysis("a", Priority::T1);
    let b = f.analysis("b", Priority::T1);

    let task = tokio::spawn({
        let service = Arc::clone(&service);
        let cancel = f.cancel.clone();
        async move { service.drain(&cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    f.probe.0.store(false, Ordering::SeqCst);

    task.await.unwrap();
    assert_eq!(handler.seen(), vec![a.clone()]);
    assert_eq!(f.status(&a), None);
    assert_eq!(f.status(&b), Some(ItemStatus::Pending));
}
