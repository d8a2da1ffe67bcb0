// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Handlers for the remote Content/Sync API.
//!
//! Every request carries a bearer token and device id from the injected
//! [`CredentialProvider`], plus an `Idempotency-Key` derived from the item id
//! so replays after a crash are harmless.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use xs_core::{
    AnswerSubmission, CacheKey, ContentRefresh, DownloadStatus, ItemKind, Question, SyncItem,
    SyncPayload,
};

use crate::config::ApiConfig;
use crate::handler::{
    Ack, BatchFuture, HandlerError, HandlerFuture, HandlerRegistry, HandlerResult, SyncHandler,
};
use crate::network::{Probe, ProbeError, ProbeFuture};

pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<String, HandlerError>> + Send + 'a>>;

/// Source of request credentials. Token issuance and refresh are external.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> TokenFuture<'_>;

    fn device_id(&self) -> String;
}

/// Fixed token and device id.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: String,
    device_id: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>, device_id: impl Into<String>) -> Self {
        StaticCredentials {
            token: token.into(),
            device_id: device_id.into(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> TokenFuture<'_> {
        Box::pin(async move { Ok(self.token.clone()) })
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }
}

const DEVICE_HEADER: &str = "X-Device-Id";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const ANSWER_BATCH_LIMIT: usize = 25;

/// Whether an HTTP status is worth retrying.
///
/// 401 is retried since the token may be refreshed before the next attempt.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
    ) || status.is_server_error()
}

fn status_error(status: StatusCode, what: &str) -> HandlerError {
    let message = format!("{what}: HTTP {status}");
    if is_retryable_status(status) {
        HandlerError::Retryable(message)
    } else {
        HandlerError::Terminal(message)
    }
}

fn transport_error(e: reqwest::Error) -> HandlerError {
    if e.is_builder() {
        HandlerError::Terminal(format!("invalid request: {e}"))
    } else {
        HandlerError::Retryable(format!("request failed: {e}"))
    }
}

/// What a 404 on a content fetch means.
fn content_not_found(refresh: &ContentRefresh) -> HandlerResult {
    match refresh.key() {
        Some(key) => Ok(Ack::ContentUnavailable { key }),
        None => Err(HandlerError::Terminal(format!(
            "no content published for {}/{}",
            refresh.subject, refresh.level
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    year: i32,
    #[serde(default)]
    questions: Vec<Question>,
}

#[derive(Debug, Serialize)]
struct StartBody<'a> {
    content_id: &'a str,
    resume: bool,
}

#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    status: DownloadStatus,
    bytes_downloaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct AnswerBody<'a> {
    client_id: &'a str,
    #[serde(flatten)]
    submission: &'a AnswerSubmission,
}

/// Client for the Content/Sync API.
pub struct HttpApi {
    client: Client,
    api: ApiConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpApi {
    pub fn new(
        api: ApiConfig,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("xsync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpApi {
            client,
            api,
            credentials,
        })
    }

    /// A registry with this API handling every item kind.
    pub fn registry(self: &Arc<Self>) -> HandlerRegistry {
        [
            ItemKind::AnswerSubmission,
            ItemKind::CloudAnalysisRequest,
            ItemKind::DownloadStart,
            ItemKind::DownloadStatusUpdate,
            ItemKind::ContentRefresh,
        ]
        .into_iter()
        .fold(HandlerRegistry::new(), |registry, kind| {
            registry.with(
                kind,
                Arc::new(HttpHandler {
                    api: Arc::clone(self),
                    kind,
                }),
            )
        })
    }

    async fn send(&self, request: RequestBuilder, idempotency_key: &str) -> Result<Response, HandlerError> {
        let token = self.credentials.bearer_token().await?;
        request
            .bearer_auth(token)
            .header(DEVICE_HEADER, self.credentials.device_id())
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn expect_success(
        &self,
        request: RequestBuilder,
        idempotency_key: &str,
        what: &str,
    ) -> HandlerResult {
        let response = self.send(request, idempotency_key).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, what));
        }
        Ok(Ack::Delivered)
    }

    async fn fetch_content(&self, item: &SyncItem, refresh: &ContentRefresh) -> HandlerResult {
        let mut query = vec![
            ("subject", refresh.subject.clone()),
            ("level", refresh.level.clone()),
        ];
        if let Some(year) = refresh.year {
            query.push(("year", year.to_string()));
        }
        let request = self
            .client
            .get(self.api.url(&self.api.content_path))
            .query(&query);

        let response = self.send(request, &item.id).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return content_not_found(refresh);
        }
        if !status.is_success() {
            return Err(status_error(status, "content fetch"));
        }

        let body: ContentResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::Retryable(format!("content body: {e}")))?;
        let year = refresh.year.unwrap_or(body.year);
        debug!(
            subject = %refresh.subject,
            level = %refresh.level,
            year,
            questions = body.questions.len(),
            "content fetched"
        );
        Ok(Ack::ContentFetched {
            key: CacheKey::new(&refresh.subject, &refresh.level, year),
            questions: body.questions,
        })
    }

    async fn deliver(&self, item: &SyncItem) -> HandlerResult {
        match &item.payload {
            SyncPayload::ContentRefresh(refresh) => self.fetch_content(item, refresh).await,
            SyncPayload::DownloadStart(start) => {
                let body = StartBody {
                    content_id: &start.content_id,
                    resume: start.resume,
                };
                let request = self
                    .client
                    .post(self.api.url(&self.api.download_start_path))
                    .json(&body);
                self.expect_success(request, &item.id, "download start").await
            }
            SyncPayload::DownloadStatusUpdate(update) => {
                let body = StatusBody {
                    status: update.status,
                    bytes_downloaded: update.bytes_downloaded,
                    error_message: update.error_message.as_deref(),
                };
                let request = self
                    .client
                    .put(self.api.url(&self.api.download_status_path))
                    .query(&[("id", update.content_id.as_str())])
                    .json(&body);
                self.expect_success(request, &item.id, "download status").await
            }
            SyncPayload::CloudAnalysisRequest(analysis) => {
                let request = self
                    .client
                    .post(self.api.url(&self.api.analysis_path))
                    .json(analysis);
                self.expect_success(request, &item.id, "analysis request").await
            }
            SyncPayload::AnswerSubmission(_) => {
                self.submit_answers(std::slice::from_ref(item)).await
            }
        }
    }

    /// Post answers as one array. The server dedupes on `client_id`.
    async fn submit_answers(&self, items: &[SyncItem]) -> HandlerResult {
        let mut body = Vec::with_capacity(items.len());
        for item in items {
            match &item.payload {
                SyncPayload::AnswerSubmission(submission) => body.push(AnswerBody {
                    client_id: &item.id,
                    submission,
                }),
                other => {
                    return Err(HandlerError::Terminal(format!(
                        "expected answer_submission, got {}",
                        other.kind()
                    )))
                }
            }
        }
        let key = match items {
            [only] => only.id.clone(),
            [first, ..] => format!("{}+{}", first.id, items.len() - 1),
            [] => return Ok(Ack::Delivered),
        };
        let request = self
            .client
            .post(self.api.url(&self.api.answers_path))
            .json(&body);
        self.expect_success(request, &key, "answer submission").await
    }
}

/// Routes one item kind to an [`HttpApi`].
struct HttpHandler {
    api: Arc<HttpApi>,
    kind: ItemKind,
}

impl SyncHandler for HttpHandler {
    fn handle<'a>(&'a self, item: &'a SyncItem) -> HandlerFuture<'a> {
        Box::pin(self.api.deliver(item))
    }

    fn batch_limit(&self) -> usize {
        match self.kind {
            ItemKind::AnswerSubmission => ANSWER_BATCH_LIMIT,
            _ => 1,
        }
    }

    fn handle_batch<'a>(&'a self, items: &'a [SyncItem]) -> BatchFuture<'a> {
        Box::pin(async move {
            if self.kind != ItemKind::AnswerSubmission {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    results.push(self.api.deliver(item).await);
                }
                return results;
            }
            let result = self.api.submit_answers(items).await;
            vec![result; items.len()]
        })
    }
}

/// Connectivity probe against the API's health endpoint.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(api: &ApiConfig, probe_path: &str) -> Result<Self, reqwest::Error> {
        Ok(HttpProbe {
            client: Client::builder().build()?,
            url: api.url(probe_path),
        })
    }
}

impl Probe for HttpProbe {
    fn probe(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            let started = tokio::time::Instant::now();
            let response = self
                .client
                .head(&self.url)
                .send()
                .await
                .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
            if response.status().is_server_error() {
                return Err(ProbeError::Unreachable(format!("HTTP {}", response.status())));
            }
            Ok(started.elapsed())
        })
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
