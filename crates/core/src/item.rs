// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Sync item types: the unit of durable pending work.
//!
//! Payloads are plain owned values. Each variant of [`SyncPayload`] carries
//! exactly what its remote call needs, so an item can cross threads and
//! process restarts without reaching back into any other component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cache::CacheKey;
use crate::download::DownloadStatus;
use crate::error::{Error, Result};

/// Priority tier. `T1` is dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    T1,
    T2,
    T3,
    T4,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 4] = [Priority::T1, Priority::T2, Priority::T3, Priority::T4];

    /// Returns the string representation used in config and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::T1 => "t1",
            Priority::T2 => "t2",
            Priority::T3 => "t3",
            Priority::T4 => "t4",
        }
    }

    /// Numeric rank stored in the database (1 = highest).
    pub fn rank(&self) -> i64 {
        match self {
            Priority::T1 => 1,
            Priority::T2 => 2,
            Priority::T3 => 3,
            Priority::T4 => 4,
        }
    }

    /// Inverse of [`Priority::rank`].
    pub fn from_rank(rank: i64) -> Result<Self> {
        match rank {
            1 => Ok(Priority::T1),
            2 => Ok(Priority::T2),
            3 => Ok(Priority::T3),
            4 => Ok(Priority::T4),
            _ => Err(Error::InvalidPriority(rank.to_string())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "t1" => Ok(Priority::T1),
            "t2" => Ok(Priority::T2),
            "t3" => Ok(Priority::T3),
            "t4" => Ok(Priority::T4),
            _ => Err(Error::InvalidPriority(s.to_string())),
        }
    }
}

/// Kind of remote work an item represents. Selects the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    AnswerSubmission,
    CloudAnalysisRequest,
    DownloadStart,
    DownloadStatusUpdate,
    ContentRefresh,
}

impl ItemKind {
    /// Returns the string representation used in storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::AnswerSubmission => "answer_submission",
            ItemKind::CloudAnalysisRequest => "cloud_analysis_request",
            ItemKind::DownloadStart => "download_start",
            ItemKind::DownloadStatusUpdate => "download_status_update",
            ItemKind::ContentRefresh => "content_refresh",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "answer_submission" => Ok(ItemKind::AnswerSubmission),
            "cloud_analysis_request" => Ok(ItemKind::CloudAnalysisRequest),
            "download_start" => Ok(ItemKind::DownloadStart),
            "download_status_update" => Ok(ItemKind::DownloadStatusUpdate),
            "content_refresh" => Ok(ItemKind::ContentRefresh),
            _ => Err(Error::InvalidItemType(s.to_string())),
        }
    }
}

/// Lifecycle status of a sync item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Ready to be dequeued.
    Pending,
    /// Claimed by the drain loop.
    InProgress,
    /// Delivered. Completed rows are deleted, so this is only ever transient.
    Completed,
    /// Last attempt failed; waiting for `next_retry_at`.
    Failed,
    /// Out of attempts or failed terminally. Kept for diagnostics.
    DeadLetter,
}

impl ItemStatus {
    /// Returns the string representation used in storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ItemStatus::Pending),
            "in_progress" => Ok(ItemStatus::InProgress),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            "dead_letter" => Ok(ItemStatus::DeadLetter),
            _ => Err(Error::InvalidStatus(s.to_string())),
        }
    }
}

/// An answer the user gave to a cached question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub key: CacheKey,
    pub question_id: String,
    pub answer: String,
    pub answered_at: DateTime<Utc>,
}

/// Request for server-side analysis after local feedback was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudAnalysisRequest {
    pub history_id: String,
    pub question: String,
    pub answer: String,
    pub local_feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStart {
    pub content_id: String,
    #[serde(default)]
    pub resume: bool,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadStatusUpdate {
    pub content_id: String,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the client observed this status. Later reports win.
    pub reported_at: DateTime<Utc>,
}

/// Fetch of content for a subject/level. `year: None` means "latest".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRefresh {
    pub subject: String,
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

impl ContentRefresh {
    /// The cache key this refresh targets, if it names a year.
    pub fn key(&self) -> Option<CacheKey> {
        self.year
            .map(|year| CacheKey::new(&self.subject, &self.level, year))
    }
}

/// Typed payload of a sync item; the variant determines the item type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncPayload {
    AnswerSubmission(AnswerSubmission),
    CloudAnalysisRequest(CloudAnalysisRequest),
    DownloadStart(DownloadStart),
    DownloadStatusUpdate(DownloadStatusUpdate),
    ContentRefresh(ContentRefresh),
}

impl SyncPayload {
    pub fn kind(&self) -> ItemKind {
        match self {
            SyncPayload::AnswerSubmission(_) => ItemKind::AnswerSubmission,
            SyncPayload::CloudAnalysisRequest(_) => ItemKind::CloudAnalysisRequest,
            SyncPayload::DownloadStart(_) => ItemKind::DownloadStart,
            SyncPayload::DownloadStatusUpdate(_) => ItemKind::DownloadStatusUpdate,
            SyncPayload::ContentRefresh(_) => ItemKind::ContentRefresh,
        }
    }
}

/// A unit of pending work, as owned by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncItem {
    pub id: String,
    pub payload: SyncPayload,
    pub priority: Priority,
    pub status: ItemStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Insertion sequence; breaks `created_at` ties.
    pub seq: i64,
}

impl SyncItem {
    pub fn kind(&self) -> ItemKind {
        self.payload.kind()
    }
}

/// One recorded failure of an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub attempt: u32,
    pub message: String,
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

/// A dead-lettered item with its full error history.
///
/// The payload is kept as stored text since it may be the reason the item
/// was dead-lettered in the first place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub item_type: String,
    pub payload: String,
    pub attempt_count: u32,
    /// `None` when the stored timestamp itself was unreadable.
    pub created_at: Option<DateTime<Utc>>,
    pub errors: Vec<ErrorRecord>,
}

/// Why a dispatch attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub retryable: bool,
}

impl Failure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Failure {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Failure {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Result of [`QueueManager::mark_failed`](crate::queue::QueueManager::mark_failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Will be retried at the given time.
    Retrying { next_retry_at: DateTime<Utc> },
    DeadLettered,
}

#[cfg(test)]
#[path = "item_tests.rs"]
mod tests;
