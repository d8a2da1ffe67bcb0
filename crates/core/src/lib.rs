// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! xs-core: Durable state for the xsync offline-first sync engine
//!
//! This crate provides the sync item model, the SQLite-backed queue, cache,
//! and download ledger, and progress conflict resolution. It is synchronous;
//! the async drain loop and network monitoring live in `xs-sync`.

pub mod backoff;
pub mod cache;
pub mod clock;
pub mod conflict;
pub mod db;
pub mod download;
pub mod error;
pub mod item;
pub mod queue;
pub mod queue_store;

pub use backoff::BackoffPolicy;
pub use cache::{
    CacheEntry, CacheKey, CacheManager, CachePolicy, CacheStatus, Freshness, Question, QueuePort,
};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use conflict::{
    ConflictResolver, FieldConflict, FieldValue, ProgressRecord, ReconcileReport, Resolution,
};
pub use download::{DownloadLedger, DownloadRecord, DownloadStatus};
pub use error::{Error, Result};
pub use item::{
    AnswerSubmission, CloudAnalysisRequest, ContentRefresh, DeadLetter, DownloadStart,
    DownloadStatusUpdate, ErrorRecord, FailOutcome, Failure, ItemKind, ItemStatus, Priority,
    SyncItem, SyncPayload,
};
pub use queue::QueueManager;
