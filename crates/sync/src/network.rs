// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Connectivity monitoring.
//!
//! A background task probes the remote API on a fixed interval and runs each
//! raw observation through a [`SettleFilter`]. Only settled transitions are
//! published, so the rest of the engine sees a single debounced signal.
//! Current state is kept in atomics for lock-free reads.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::NetworkConfig;

/// Published connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
    /// Reachable, but too slow for anything beyond single-item calls.
    Degraded,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Online => "online",
            ConnectivityState::Offline => "offline",
            ConnectivityState::Degraded => "degraded",
        }
    }

    /// Remote calls may be attempted.
    pub fn is_connected(&self) -> bool {
        !matches!(self, ConnectivityState::Offline)
    }

    fn to_u8(self) -> u8 {
        match self {
            ConnectivityState::Offline => 0,
            ConnectivityState::Online => 1,
            ConnectivityState::Degraded => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectivityState::Online,
            2 => ConnectivityState::Degraded,
            _ => ConnectivityState::Offline,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse link tier used to size dispatch batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkQuality {
    Poor,
    Fair,
    Good,
}

impl LinkQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkQuality::Poor => "poor",
            LinkQuality::Fair => "fair",
            LinkQuality::Good => "good",
        }
    }

    /// Most items one remote call should carry on this link.
    pub fn batch_size(&self) -> usize {
        match self {
            LinkQuality::Good => 25,
            LinkQuality::Fair => 10,
            LinkQuality::Poor => 1,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            LinkQuality::Poor => 0,
            LinkQuality::Fair => 1,
            LinkQuality::Good => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            2 => LinkQuality::Good,
            1 => LinkQuality::Fair,
            _ => LinkQuality::Poor,
        }
    }
}

impl fmt::Display for LinkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A settled connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub old: ConnectivityState,
    pub new: ConnectivityState,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    /// Transition from offline to any connected state.
    pub fn is_reconnect(&self) -> bool {
        !self.old.is_connected() && self.new.is_connected()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("probe timed out")]
    TimedOut,
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<Duration, ProbeError>> + Send + 'a>>;

/// One reachability check against the remote service.
///
/// Resolves to the observed round-trip latency.
pub trait Probe: Send + Sync {
    fn probe(&self) -> ProbeFuture<'_>;
}

/// Timing knobs for [`NetworkMonitor`].
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub settle_window: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub good_latency: Duration,
    pub fair_latency: Duration,
}

impl From<&NetworkConfig> for MonitorSettings {
    fn from(config: &NetworkConfig) -> Self {
        MonitorSettings {
            settle_window: config.settle_window(),
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            good_latency: config.good_latency(),
            fair_latency: config.fair_latency(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings::from(&NetworkConfig::default())
    }
}

impl MonitorSettings {
    /// Map a probe result onto a raw state and link tier.
    pub fn classify(
        &self,
        result: &Result<Duration, ProbeError>,
    ) -> (ConnectivityState, LinkQuality) {
        match result {
            Err(_) => (ConnectivityState::Offline, LinkQuality::Poor),
            Ok(latency) if *latency <= self.good_latency => {
                (ConnectivityState::Online, LinkQuality::Good)
            }
            Ok(latency) if *latency <= self.fair_latency => {
                (ConnectivityState::Online, LinkQuality::Fair)
            }
            Ok(_) => (ConnectivityState::Degraded, LinkQuality::Poor),
        }
    }
}

/// Debounces raw observations into published transitions.
///
/// Losing connectivity is published at once. Any connected state must be
/// observed continuously for the whole window before it is published.
#[derive(Debug, Clone)]
pub struct SettleFilter {
    window: Duration,
    published: ConnectivityState,
    candidate: Option<(ConnectivityState, Instant)>,
}

impl SettleFilter {
    pub fn new(window: Duration) -> Self {
        SettleFilter {
            window,
            published: ConnectivityState::Offline,
            candidate: None,
        }
    }

    pub fn published(&self) -> ConnectivityState {
        self.published
    }

    /// Feed one observation. Returns the new state when it gets published.
    pub fn observe(&mut self, raw: ConnectivityState, now: Instant) -> Option<ConnectivityState> {
        if raw == self.published {
            self.candidate = None;
            return None;
        }
        if !raw.is_connected() {
            return Some(self.publish(raw));
        }

        let since = match self.candidate {
            Some((state, since)) if state == raw => since,
            _ => {
                self.candidate = Some((raw, now));
                now
            }
        };
        if now.saturating_duration_since(since) >= self.window {
            Some(self.publish(raw))
        } else {
            None
        }
    }

    fn publish(&mut self, state: ConnectivityState) -> ConnectivityState {
        self.published = state;
        self.candidate = None;
        state
    }
}

/// Monitor state readable without locking.
struct SharedNetworkState {
    state: AtomicU8,
    quality: AtomicU8,
    /// Unix millis of the last published transition; 0 if none yet.
    last_transition_ms: AtomicI64,
}

impl SharedNetworkState {
    fn new() -> Self {
        SharedNetworkState {
            state: AtomicU8::new(ConnectivityState::Offline.to_u8()),
            quality: AtomicU8::new(LinkQuality::Poor.to_u8()),
            last_transition_ms: AtomicI64::new(0),
        }
    }
}

const EVENT_CAPACITY: usize = 16;

/// Probes connectivity and publishes settled transitions.
pub struct NetworkMonitor {
    probe: Arc<dyn Probe>,
    settings: MonitorSettings,
    shared: SharedNetworkState,
    events: broadcast::Sender<StatusChange>,
}

impl NetworkMonitor {
    pub fn new(probe: Arc<dyn Probe>, settings: MonitorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        NetworkMonitor {
            probe,
            settings,
            shared: SharedNetworkState::new(),
            events,
        }
    }

    /// Last published connectivity. Starts `Offline`.
    pub fn get_status(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Link tier from the most recent probe.
    pub fn link_quality(&self) -> LinkQuality {
        LinkQuality::from_u8(self.shared.quality.load(Ordering::Acquire))
    }

    pub fn last_transition_at(&self) -> Option<DateTime<Utc>> {
        match self.shared.last_transition_ms.load(Ordering::Acquire) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// Receive every settled transition published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.events.subscribe()
    }

    /// Probe until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut filter = SettleFilter::new(self.settings.settle_window);
        info!(
            settle_ms = self.settings.settle_window.as_millis() as u64,
            "network monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(self.settings.probe_timeout, self.probe.probe()) => {
                    r.unwrap_or(Err(ProbeError::TimedOut))
                }
            };
            if let Err(e) = &result {
                debug!(error = %e, "probe failed");
            }

            let (raw, quality) = self.settings.classify(&result);
            self.shared.quality.store(quality.to_u8(), Ordering::Release);
            if let Some(new) = filter.observe(raw, Instant::now()) {
                self.publish(new);
            }
        }
        info!("network monitor stopped");
    }

    fn publish(&self, new: ConnectivityState) {
        let old = ConnectivityState::from_u8(self.shared.state.swap(new.to_u8(), Ordering::AcqRel));
        let at = Utc::now();
        self.shared
            .last_transition_ms
            .store(at.timestamp_millis(), Ordering::Release);
        info!(%old, %new, quality = %self.link_quality(), "connectivity changed");
        // No subscribers is fine; the atomics still carry the state.
        let _ = self.events.send(StatusChange { old, new, at });
    }
}

#[cfg(test)]
#[path = "network_tests.rs"]
mod tests;
