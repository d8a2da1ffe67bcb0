// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

//! End-to-end engine behavior with a scripted link and in-process handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::Instant;
use xs_core::clock::to_delta;
use xs_core::{
    CacheKey, ClockSource, CloudAnalysisRequest, Freshness, ItemKind, Priority, Question,
    SyncItem, SyncPayload,
};
use xs_sync::handler::HandlerFuture;
use xs_sync::network::ProbeFuture;
use xs_sync::{
    Ack, Config, ConnectivityState, HandlerError, HandlerRegistry, Probe, ProbeError,
    SyncEngine, SyncHandler,
};

/// Wall clock that follows tokio's (paused) clock.
struct TokioClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl TokioClock {
    fn new() -> Arc<Self> {
        Arc::new(TokioClock {
            base: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
            started: Instant::now(),
        })
    }
}

impl ClockSource for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + to_delta(self.started.elapsed())
    }
}

#[derive(Default)]
struct Link(AtomicBool);

impl Link {
    fn set(&self, up: bool) {
        self.0.store(up, Ordering::SeqCst);
    }
}

impl Probe for Link {
    fn probe(&self) -> ProbeFuture<'_> {
        let up = self.0.load(Ordering::SeqCst);
        Box::pin(async move {
            if up {
                Ok(Duration::from_millis(40))
            } else {
                Err(ProbeError::Unreachable("link down".into()))
            }
        })
    }
}

/// Delivers analysis requests, failing each history id as scripted first.
#[derive(Default)]
struct AnalysisApi {
    delivered: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, Vec<HandlerError>>>,
}

impl AnalysisApi {
    fn fail_first(&self, history_id: &str, errors: Vec<HandlerError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(history_id.to_string(), errors);
    }

    fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

impl SyncHandler for AnalysisApi {
    fn handle<'a>(&'a self, item: &'a SyncItem) -> HandlerFuture<'a> {
        Box::pin(async move {
            let SyncPayload::CloudAnalysisRequest(req) = &item.payload else {
                return Err(HandlerError::Terminal("wrong kind".into()));
            };
            let scripted = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&req.history_id)
                .and_then(|errors| (!errors.is_empty()).then(|| errors.remove(0)));
            if let Some(err) = scripted {
                return Err(err);
            }
            self.delivered.lock().unwrap().push(req.history_id.clone());
            Ok(Ack::Delivered)
        })
    }
}

/// Serves ten questions for 2024 and nothing else.
struct ContentApi;

impl SyncHandler for ContentApi {
    fn handle<'a>(&'a self, item: &'a SyncItem) -> HandlerFuture<'a> {
        Box::pin(async move {
            let SyncPayload::ContentRefresh(refresh) = &item.payload else {
                return Err(HandlerError::Terminal("wrong kind".into()));
            };
            let year = refresh.year.unwrap_or(2024);
            let key = CacheKey::new(&refresh.subject, &refresh.level, year);
            if year != 2024 {
                return Ok(Ack::ContentUnavailable { key });
            }
            let questions = (0..10)
                .map(|i| Question {
                    id: format!("q{i}"),
                    body: json!({ "n": i }),
                })
                .collect();
            Ok(Ack::ContentFetched { key, questions })
        })
    }
}

fn analysis(tag: &str) -> SyncPayload {
    SyncPayload::CloudAnalysisRequest(CloudAnalysisRequest {
        history_id: tag.into(),
        question: "Define entropy".into(),
        answer: "disorder".into(),
        local_feedback: "partially correct".into(),
    })
}

struct Harness {
    engine: SyncEngine,
    link: Arc<Link>,
    api: Arc<AnalysisApi>,
}

fn harness(db: Option<&std::path::Path>) -> Harness {
    let link = Arc::new(Link::default());
    let api = Arc::new(AnalysisApi::default());
    let handlers = HandlerRegistry::new()
        .with(ItemKind::CloudAnalysisRequest, api.clone())
        .with(ItemKind::ContentRefresh, Arc::new(ContentApi));

    let mut builder = SyncEngine::builder(Config::default())
        .clock(TokioClock::new())
        .probe(link.clone())
        .handlers(handlers);
    if let Some(path) = db {
        builder = builder.db_path(path);
    }
    Harness {
        engine: builder.build().unwrap(),
        link,
        api,
    }
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_drains_in_priority_order() {
    let h = harness(None);
    h.engine.start().unwrap();

    h.engine.enqueue(analysis("t1-first"), Priority::T1).unwrap();
    h.engine.enqueue(analysis("t3"), Priority::T3).unwrap();
    h.engine.enqueue(analysis("t1-second"), Priority::T1).unwrap();
    advance(2_000).await;
    assert!(h.api.delivered().is_empty());

    h.link.set(true);
    advance(5_000).await;

    assert_eq!(h.api.delivered(), vec!["t1-first", "t1-second", "t3"]);
    assert_eq!(h.engine.queue_depth(None), 0);
    assert_eq!(h.engine.connectivity(), ConnectivityState::Online);
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn items_queued_offline_reach_a_final_state() {
    let h = harness(None);
    h.api.fail_first(
        "flaky",
        vec![
            HandlerError::Retryable("503".into()),
            HandlerError::Retryable("timeout".into()),
        ],
    );
    h.api.fail_first("rejected", vec![HandlerError::Terminal("422".into())]);
    h.api
        .fail_first("down", vec![HandlerError::Retryable("502".into()); 10]);
    h.engine.start().unwrap();

    for tag in ["flaky", "rejected", "down"] {
        h.engine.enqueue(analysis(tag), Priority::T2).unwrap();
    }
    h.link.set(true);
    advance(120_000).await;

    assert_eq!(h.api.delivered(), vec!["flaky"]);
    assert_eq!(h.engine.queue_depth(None), 0);

    let dead = h.engine.dead_letters().unwrap();
    assert_eq!(dead.len(), 2);
    let rejected = dead.iter().find(|d| d.payload.contains("rejected")).unwrap();
    assert_eq!(rejected.errors.len(), 1);
    let down = dead.iter().find(|d| d.payload.contains("\"down\"")).unwrap();
    assert_eq!(down.attempt_count, 5);
    assert_eq!(down.errors.len(), 5);

    let stats = h.engine.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dead_lettered, 2);
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn flapping_link_triggers_one_drain_after_settling() {
    let h = harness(None);
    h.engine.enqueue(analysis("a"), Priority::T1).unwrap();
    h.engine.start().unwrap();

    // Probes run on whole seconds; flip between them for four seconds.
    advance(500).await;
    for up in [true, false, true, false] {
        h.link.set(up);
        advance(1_000).await;
    }
    assert_eq!(h.engine.stats().drains_started, 0);

    h.link.set(true);
    advance(3_000).await;
    assert_eq!(h.engine.stats().drains_started, 0);
    assert_eq!(h.engine.connectivity(), ConnectivityState::Offline);

    advance(1_000).await;
    assert_eq!(h.engine.stats().drains_started, 1);
    assert_eq!(h.api.delivered(), vec!["a"]);

    advance(10_000).await;
    assert_eq!(h.engine.stats().drains_started, 1);
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn queued_work_survives_restart() {
    let temp = TempDir::new().unwrap();
    let db = temp.path().join("sync.db");

    let first = harness(Some(&db));
    first.engine.start().unwrap();
    first.engine.enqueue(analysis("kept"), Priority::T2).unwrap();
    first.engine.stop().await;
    drop(first);

    let second = harness(Some(&db));
    assert_eq!(second.engine.queue_depth(None), 1);
    second.engine.start().unwrap();
    second.link.set(true);
    advance(5_000).await;

    assert_eq!(second.api.delivered(), vec!["kept"]);
    assert_eq!(second.engine.queue_depth(None), 0);
    second.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn consumption_drives_next_year_fetch() {
    let h = harness(None);
    h.engine.start().unwrap();
    h.link.set(true);

    assert!(h.engine.request_content("physics", "hl", Some(2024)).unwrap().is_some());
    assert!(h.engine.request_content("physics", "hl", Some(2024)).unwrap().is_none());
    advance(5_000).await;

    let entries = h.engine.cache_get("physics", "hl");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].item_count, 10);

    let key = CacheKey::new("physics", "hl", 2024);
    let mut requested = Vec::new();
    for i in 0..9 {
        requested.push(h.engine.record_consumption(&key, &format!("q{i}")).unwrap());
    }
    // 8 of 10 crosses the 75% threshold; the 9th finds the fetch pending.
    assert!(requested[..7].iter().all(Vec::is_empty));
    assert_eq!(requested[7].len(), 1);
    assert!(requested[8].is_empty());

    let status = h.engine.cache_status("physics", "hl").unwrap();
    assert_eq!(status.freshness, Freshness::RefreshPending);
    assert!((status.completion_ratio - 0.9).abs() < f64::EPSILON);

    // The server has nothing for 2025; the cache remembers and stops asking.
    advance(5_000).await;
    assert_eq!(h.engine.queue_depth(None), 0);
    assert!(h.engine.record_consumption(&key, "q9").unwrap().is_empty());
    assert_eq!(
        h.engine.cache_status("physics", "hl").unwrap().freshness,
        Freshness::Fresh
    );
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn engine_starts_once() {
    let h = harness(None);
    h.engine.start().unwrap();
    assert!(h.engine.start().is_err());
    h.engine.stop().await;
}
