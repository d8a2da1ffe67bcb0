// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use std::sync::atomic::AtomicBool;
use yare::parameterized;

const ONLINE: ConnectivityState = ConnectivityState::Online;
const OFFLINE: ConnectivityState = ConnectivityState::Offline;
const DEGRADED: ConnectivityState = ConnectivityState::Degraded;

struct SwitchProbe {
    up: AtomicBool,
    latency: Duration,
}

impl SwitchProbe {
    fn new(up: bool) -> Arc<Self> {
        Arc::new(SwitchProbe {
            up: AtomicBool::new(up),
            latency: Duration::from_millis(20),
        })
    }

    fn set(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }
}

impl Probe for SwitchProbe {
    fn probe(&self) -> ProbeFuture<'_> {
        let up = self.up.load(Ordering::SeqCst);
        let latency = self.latency;
        Box::pin(async move {
            if up {
                Ok(latency)
            } else {
                Err(ProbeError::Unreachable("switched off".to_string()))
            }
        })
    }
}

struct HangingProbe;

impl Probe for HangingProbe {
    fn probe(&self) -> ProbeFuture<'_> {
        Box::pin(std::future::pending())
    }
}

fn settings() -> MonitorSettings {
    MonitorSettings {
        settle_window: Duration::from_secs(3),
        probe_interval: Duration::from_secs(1),
        probe_timeout: Duration::from_millis(500),
        good_latency: Duration::from_millis(150),
        fair_latency: Duration::from_millis(600),
    }
}

#[parameterized(
    fast = { 20, ONLINE, LinkQuality::Good },
    at_good_edge = { 150, ONLINE, LinkQuality::Good },
    fair = { 400, ONLINE, LinkQuality::Fair },
    slow = { 601, DEGRADED, LinkQuality::Poor },
)]
fn classify_latency(ms: u64, state: ConnectivityState, quality: LinkQuality) {
    assert_eq!(settings().classify(&Ok(Duration::from_millis(ms))), (state, quality));
}

#[test]
fn classify_error_is_offline() {
    let result = Err(ProbeError::TimedOut);
    assert_eq!(settings().classify(&result), (OFFLINE, LinkQuality::Poor));
}

#[parameterized(
    good = { LinkQuality::Good, 25 },
    fair = { LinkQuality::Fair, 10 },
    poor = { LinkQuality::Poor, 1 },
)]
fn batch_size_by_quality(quality: LinkQuality, size: usize) {
    assert_eq!(quality.batch_size(), size);
}

#[test]
fn degraded_counts_as_connected() {
    assert!(ONLINE.is_connected());
    assert!(DEGRADED.is_connected());
    assert!(!OFFLINE.is_connected());
}

#[tokio::test(start_paused = true)]
async fn settle_filter_publishes_online_after_window() {
    let mut f = SettleFilter::new(Duration::from_secs(3));
    let t0 = Instant::now();

    assert_eq!(f.observe(ONLINE, t0), None);
    assert_eq!(f.observe(ONLINE, t0 + Duration::from_secs(2)), None);
    assert_eq!(f.observe(ONLINE, t0 + Duration::from_secs(3)), Some(ONLINE));
    assert_eq!(f.published(), ONLINE);
    assert_eq!(f.observe(ONLINE, t0 + Duration::from_secs(4)), None);
}

#[tokio::test(start_paused = true)]
async fn settle_filter_publishes_offline_at_once() {
    let mut f = SettleFilter::new(Duration::ZERO);
    let t0 = Instant::now();
    assert_eq!(f.observe(ONLINE, t0), Some(ONLINE));

    let mut f = SettleFilter {
        window: Duration::from_secs(3),
        ..f
    };
    assert_eq!(f.observe(OFFLINE, t0), Some(OFFLINE));
}

#[tokio::test(start_paused = true)]
async fn settle_filter_flapping_never_publishes() {
    let mut f = SettleFilter::new(Duration::from_secs(3));
    let t0 = Instant::now();

    for (i, state) in [ONLINE, OFFLINE, ONLINE, OFFLINE, ONLINE].into_iter().enumerate() {
        let at = t0 + Duration::from_secs(i as u64);
        assert_eq!(f.observe(state, at), None, "tick {i}");
    }
    assert_eq!(f.published(), OFFLINE);
}

#[tokio::test(start_paused = true)]
async fn settle_filter_restarts_window_on_new_target() {
    let mut f = SettleFilter::new(Duration::from_secs(3));
    let t0 = Instant::now();

    assert_eq!(f.observe(ONLINE, t0), None);
    assert_eq!(f.observe(DEGRADED, t0 + Duration::from_secs(2)), None);
    assert_eq!(f.observe(DEGRADED, t0 + Duration::from_secs(4)), None);
    assert_eq!(f.observe(DEGRADED, t0 + Duration::from_secs(5)), Some(DEGRADED));
}

#[tokio::test(start_paused = true)]
async fn monitor_publishes_after_settling() {
    let probe = SwitchProbe::new(true);
    let monitor = Arc::new(NetworkMonitor::new(probe.clone(), settings()));
    let mut events = monitor.subscribe();
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let cancel = cancel.clone();
        async move { monitor.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(monitor.get_status(), OFFLINE);
    assert_eq!(monitor.link_quality(), LinkQuality::Good);

    let change = events.recv().await.unwrap();
    assert_eq!((change.old, change.new), (OFFLINE, ONLINE));
    assert!(change.is_reconnect());
    assert_eq!(monitor.get_status(), ONLINE);
    assert!(monitor.last_transition_at().is_some());

    probe.set(false);
    let change = events.recv().await.unwrap();
    assert_eq!(change.new, OFFLINE);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn hanging_probe_counts_as_offline() {
    let monitor = Arc::new(NetworkMonitor::new(Arc::new(HangingProbe), settings()));
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let monitor = Arc::clone(&monitor);
        let cancel = cancel.clone();
        async move { monitor.run(cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(monitor.get_status(), OFFLINE);
    assert!(monitor.last_transition_at().is_none());

    cancel.cancel();
    task.await.unwrap();
}
