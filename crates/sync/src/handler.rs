// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Per-item-type remote call contract.
//!
//! Handlers must be idempotent: after a crash between a successful call and
//! `mark_complete`, the same item is delivered again.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use xs_core::{CacheKey, Failure, ItemKind, Question, SyncItem};

/// What a successful remote call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    /// Delivered; nothing to apply locally.
    Delivered,
    /// New content for a cache key.
    ContentFetched {
        key: CacheKey,
        questions: Vec<Question>,
    },
    /// The server has no content for this key.
    ContentUnavailable { key: CacheKey },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// Worth trying again after backoff.
    #[error("{0}")]
    Retryable(String),

    /// Will never succeed; dead-letter immediately.
    #[error("{0}")]
    Terminal(String),
}

impl HandlerError {
    pub fn into_failure(self) -> Failure {
        match self {
            HandlerError::Retryable(msg) => Failure::retryable(msg),
            HandlerError::Terminal(msg) => Failure::terminal(msg),
        }
    }
}

pub type HandlerResult = Result<Ack, HandlerError>;

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;

pub type BatchFuture<'a> = Pin<Box<dyn Future<Output = Vec<HandlerResult>> + Send + 'a>>;

/// Delivers one kind of [`SyncItem`] to the remote service.
pub trait SyncHandler: Send + Sync {
    fn handle<'a>(&'a self, item: &'a SyncItem) -> HandlerFuture<'a>;

    /// Most items this handler accepts in one [`handle_batch`](Self::handle_batch) call.
    fn batch_limit(&self) -> usize {
        1
    }

    /// Deliver several items of this kind. Returns one result per item, in order.
    fn handle_batch<'a>(&'a self, items: &'a [SyncItem]) -> BatchFuture<'a> {
        Box::pin(async move {
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                results.push(self.handle(item).await);
            }
            results
        })
    }
}

/// Handlers keyed by the item kind they deliver.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<ItemKind, Arc<dyn SyncHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: ItemKind, handler: Arc<dyn SyncHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn with(mut self, kind: ItemKind, handler: Arc<dyn SyncHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: ItemKind) -> Option<Arc<dyn SyncHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
