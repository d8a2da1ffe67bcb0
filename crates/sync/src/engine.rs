// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Process root wiring the stores, monitor, and drain loop together.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use xs_core::{
    db, CacheEntry, CacheKey, CacheManager, CacheStatus, ClockSource, ConflictResolver, ContentRefresh,
    DeadLetter, DownloadLedger, DownloadRecord, FieldConflict, FieldValue, Priority, QueueManager,
    QueuePort, Resolution, SyncPayload, SystemClock,
};

use crate::config::{Config, ConfigError};
use crate::error::{Result, SyncError};
use crate::handler::HandlerRegistry;
use crate::http::{CredentialProvider, HttpApi, HttpProbe};
use crate::network::{ConnectivityState, LinkQuality, MonitorSettings, NetworkMonitor, Probe, StatusChange};
use crate::service::{ProgressSync, SyncService, SyncStats};

/// Assembles a [`SyncEngine`].
///
/// Without a store path everything is kept in memory. Without explicit
/// handlers or a probe, the HTTP implementations are used; those need
/// credentials.
pub struct SyncEngineBuilder {
    config: Config,
    db_path: Option<PathBuf>,
    clock: Arc<dyn ClockSource>,
    probe: Option<Arc<dyn Probe>>,
    handlers: Option<HandlerRegistry>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    progress: Option<Arc<dyn ProgressSync>>,
}

impl SyncEngineBuilder {
    pub fn new(config: Config) -> Self {
        SyncEngineBuilder {
            config,
            db_path: None,
            clock: Arc::new(SystemClock),
            probe: None,
            handlers: None,
            credentials: None,
            progress: None,
        }
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ProgressSync>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn connection(&self) -> xs_core::Result<db::Connection> {
        match &self.db_path {
            Some(path) => db::open_connection(path),
            None => db::open_in_memory(),
        }
    }

    pub fn build(mut self) -> Result<SyncEngine> {
        self.config.validate()?;
        let config = &self.config;
        let clock = Arc::clone(&self.clock);

        let queue = Arc::new(QueueManager::with_connection(
            self.connection()?,
            config.queue.backoff_policy(),
            Arc::clone(&clock),
        )?);
        let cache = Arc::new(CacheManager::with_connection(
            self.connection()?,
            queue.clone(),
            config.cache.cache_policy(),
            Arc::clone(&clock),
        )?);
        let downloads = Arc::new(DownloadLedger::with_connection(self.connection()?)?);

        let handlers = match self.handlers.take() {
            Some(handlers) => handlers,
            None => {
                let credentials = self.credentials.clone().ok_or_else(|| {
                    ConfigError::Invalid("the HTTP handler set needs credentials".to_string())
                })?;
                let api = HttpApi::new(config.api.clone(), credentials, config.sync.call_timeout())?;
                Arc::new(api).registry()
            }
        };
        let probe: Arc<dyn Probe> = match self.probe.take() {
            Some(probe) => probe,
            None => Arc::new(HttpProbe::new(&config.api, &config.network.probe_path)?),
        };

        let monitor = Arc::new(NetworkMonitor::new(
            probe,
            MonitorSettings::from(&config.network),
        ));
        let conflicts = Arc::new(ConflictResolver::with_connection(
            self.connection()?,
            config.sync.conflict_window(),
            Arc::clone(&clock),
        )?);

        let mut service = SyncService::new(
            Arc::clone(&queue),
            Arc::clone(&cache),
            Arc::clone(&downloads),
            Arc::clone(&monitor),
            handlers,
            Arc::clone(&conflicts),
            clock,
        )
        .with_call_timeout(config.sync.call_timeout())
        .with_device_id(config.api.device_id.clone());
        if let Some(progress) = self.progress {
            service = service.with_progress(progress);
        }

        Ok(SyncEngine {
            queue,
            cache,
            downloads,
            monitor,
            conflicts,
            service: Arc::new(service),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Offline-first sync engine.
///
/// Producers call the facade methods from any thread. `start` spawns the
/// background tasks on the current tokio runtime; `stop` shuts them down
/// and returns claimed items to the queue. An engine runs at most once.
pub struct SyncEngine {
    queue: Arc<QueueManager>,
    cache: Arc<CacheManager>,
    downloads: Arc<DownloadLedger>,
    monitor: Arc<NetworkMonitor>,
    conflicts: Arc<ConflictResolver>,
    service: Arc<SyncService>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncEngine {
    pub fn builder(config: Config) -> SyncEngineBuilder {
        SyncEngineBuilder::new(config)
    }

    /// Spawn the network monitor and drain loop.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SyncError::AlreadyStarted);
        }

        let monitor = Arc::clone(&self.monitor);
        let cancel = self.cancel.clone();
        let monitor_task = tokio::spawn(async move { monitor.run(cancel).await });

        let service = Arc::clone(&self.service);
        let cancel = self.cancel.clone();
        let service_task = tokio::spawn(async move { service.run(cancel).await });

        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([monitor_task, service_task]);

        let requested = self.trigger_app_start()?;
        info!(
            depth = self.queue.queue_depth(None),
            refreshes = requested.len(),
            "sync engine started"
        );
        Ok(())
    }

    /// Cancel background work and wait for it to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        // The drain loop releases its own claims; this covers a task that
        // panicked before it could.
        match self.queue.release_all_in_progress() {
            Ok(0) => {}
            Ok(n) => warn!(released = n, "released items left in flight"),
            Err(e) => warn!(error = %e, "failed to release in-flight items"),
        }
        info!(depth = self.queue.queue_depth(None), "sync engine stopped");
    }

    pub fn enqueue(&self, payload: SyncPayload, priority: Priority) -> Result<String> {
        Ok(self.queue.enqueue(payload, priority)?)
    }

    pub fn queue_depth(&self, priority: Option<Priority>) -> usize {
        self.queue.queue_depth(priority)
    }

    pub fn cache_status(&self, subject: &str, level: &str) -> Result<CacheStatus> {
        Ok(self.cache.cache_status(subject, level)?)
    }

    /// Cached entries for a subject/level, oldest year first. Never blocks on
    /// the network.
    pub fn cache_get(&self, subject: &str, level: &str) -> Vec<Arc<CacheEntry>> {
        self.cache.get(subject, level)
    }

    /// Record that a question was answered, then check whether the next
    /// year should be fetched.
    pub fn record_consumption(&self, key: &CacheKey, question_id: &str) -> Result<Vec<String>> {
        self.cache.record_consumption(key, question_id)?;
        Ok(self.cache.maybe_refresh(&key.subject, &key.level)?)
    }

    /// Queue an explicit content fetch unless one for the same target is
    /// already pending. `year: None` asks for the latest year.
    pub fn request_content(&self, subject: &str, level: &str, year: Option<i32>) -> Result<Option<String>> {
        if self.queue.pending_refresh(subject, level, year) {
            return Ok(None);
        }
        let id = self.queue.enqueue_refresh(ContentRefresh {
            subject: subject.to_string(),
            level: level.to_string(),
            year,
        })?;
        Ok(Some(id))
    }

    /// Run the completion-based refresh check across the whole cache.
    pub fn trigger_app_start(&self) -> Result<Vec<String>> {
        Ok(self.cache.refresh_due()?)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.queue.dead_letters()?)
    }

    pub fn retry_dead_letter(&self, id: &str) -> Result<()> {
        Ok(self.queue.retry_dead_letter(id)?)
    }

    pub fn purge_dead_letter(&self, id: &str) -> Result<()> {
        Ok(self.queue.purge_dead_letter(id)?)
    }

    pub fn downloads(&self) -> Result<Vec<DownloadRecord>> {
        Ok(self.downloads.list()?)
    }

    pub fn pending_conflicts(&self) -> Result<Vec<FieldConflict>> {
        Ok(self.conflicts.pending_conflicts()?)
    }

    pub fn resolve_conflict(&self, conflict_id: u64, choice: Resolution) -> Result<FieldValue> {
        Ok(self.conflicts.resolve(conflict_id, choice)?)
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.get_status()
    }

    pub fn link_quality(&self) -> LinkQuality {
        self.monitor.link_quality()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.monitor.subscribe()
    }

    pub fn stats(&self) -> SyncStats {
        self.service.stats()
    }
}
