// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for xs-core operations.

use thiserror::Error;

/// All possible errors that can occur in xs-core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("sync item not found: {0}")]
    ItemNotFound(String),

    #[error("sync item {0} is not in progress\n  hint: it may have been requeued by a recovery pass")]
    NotInProgress(String),

    #[error("sync item {0} is not dead-lettered")]
    NotDeadLettered(String),

    #[error("invalid priority: '{0}'\n  hint: valid priorities are: t1, t2, t3, t4")]
    InvalidPriority(String),

    #[error("invalid item type: '{0}'\n  hint: valid types are: answer_submission, cloud_analysis_request, download_start, download_status_update, content_refresh")]
    InvalidItemType(String),

    #[error("invalid item status: '{0}'")]
    InvalidStatus(String),

    #[error("invalid download status: '{0}'\n  hint: valid statuses are: started, completed, paused, failed")]
    InvalidDownloadStatus(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(u64),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupted data: {0}")]
    CorruptedData(String),
}

/// A specialized Result type for xs-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
