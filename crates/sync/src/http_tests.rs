// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use chrono::Utc;
use xs_core::{CloudAnalysisRequest, ItemStatus, Priority};
use yare::parameterized;

#[parameterized(
    unauthorized = { 401, true },
    request_timeout = { 408, true },
    too_many = { 429, true },
    internal = { 500, true },
    bad_gateway = { 502, true },
    unavailable = { 503, true },
    bad_request = { 400, false },
    forbidden = { 403, false },
    not_found = { 404, false },
    unprocessable = { 422, false },
)]
fn status_classification(code: u16, retryable: bool) {
    let status = StatusCode::from_u16(code).unwrap();
    assert_eq!(is_retryable_status(status), retryable);
    assert_eq!(
        matches!(status_error(status, "x"), HandlerError::Retryable(_)),
        retryable
    );
}

#[test]
fn missing_year_content_is_unavailable_not_an_error() {
    let refresh = ContentRefresh {
        subject: "math".into(),
        level: "hl".into(),
        year: Some(2027),
    };
    assert_eq!(
        content_not_found(&refresh).unwrap(),
        Ack::ContentUnavailable {
            key: CacheKey::new("math", "hl", 2027)
        }
    );
}

#[test]
fn missing_latest_content_is_terminal() {
    let refresh = ContentRefresh {
        subject: "math".into(),
        level: "hl".into(),
        year: None,
    };
    assert!(matches!(
        content_not_found(&refresh),
        Err(HandlerError::Terminal(_))
    ));
}

#[test]
fn content_response_tolerates_missing_questions() {
    let body: ContentResponse = serde_json::from_str(r#"{"year": 2024}"#).unwrap();
    assert_eq!(body.year, 2024);
    assert!(body.questions.is_empty());
}

#[test]
fn answer_body_carries_client_id() {
    let submission = AnswerSubmission {
        key: CacheKey::new("chem", "sl", 2023),
        question_id: "q9".into(),
        answer: "B".into(),
        answered_at: Utc::now(),
    };
    let json = serde_json::to_value(AnswerBody {
        client_id: "item-1",
        submission: &submission,
    })
    .unwrap();
    assert_eq!(json["client_id"], "item-1");
    assert_eq!(json["question_id"], "q9");
    assert_eq!(json["key"]["year"], 2023);
}

#[test]
fn status_body_omits_empty_error() {
    let json = serde_json::to_value(StatusBody {
        status: DownloadStatus::Paused,
        bytes_downloaded: 10,
        error_message: None,
    })
    .unwrap();
    assert_eq!(json["status"], "paused");
    assert!(json.get("error_message").is_none());
}

fn unreachable_api() -> Arc<HttpApi> {
    let api = ApiConfig {
        base_url: "http://127.0.0.1:1".into(),
        ..ApiConfig::default()
    };
    let credentials = Arc::new(StaticCredentials::new("token", "dev-1"));
    Arc::new(HttpApi::new(api, credentials, Duration::from_secs(2)).unwrap())
}

fn analysis_item() -> SyncItem {
    SyncItem {
        id: "item-1".into(),
        payload: SyncPayload::CloudAnalysisRequest(CloudAnalysisRequest {
            history_id: "h1".into(),
            question: "q".into(),
            answer: "a".into(),
            local_feedback: "f".into(),
        }),
        priority: Priority::T1,
        status: ItemStatus::InProgress,
        attempt_count: 0,
        last_attempt_at: None,
        next_retry_at: None,
        created_at: Utc::now(),
        seq: 1,
    }
}

#[tokio::test]
async fn connection_refused_is_retryable() {
    let registry = unreachable_api().registry();
    let handler = registry.get(ItemKind::CloudAnalysisRequest).unwrap();

    let result = handler.handle(&analysis_item()).await;
    assert!(matches!(result, Err(HandlerError::Retryable(_))));
}

#[test]
fn registry_covers_every_kind() {
    let registry = unreachable_api().registry();
    for kind in [
        ItemKind::AnswerSubmission,
        ItemKind::CloudAnalysisRequest,
        ItemKind::DownloadStart,
        ItemKind::DownloadStatusUpdate,
        ItemKind::ContentRefresh,
    ] {
        assert!(registry.get(kind).is_some(), "{kind}");
    }
    assert_eq!(
        registry.get(ItemKind::AnswerSubmission).unwrap().batch_limit(),
        ANSWER_BATCH_LIMIT
    );
    assert_eq!(registry.get(ItemKind::DownloadStart).unwrap().batch_limit(), 1);
}

#[tokio::test]
async fn probe_reports_unreachable_host() {
    let probe = HttpProbe::new(
        &ApiConfig {
            base_url: "http://127.0.0.1:1".into(),
            ..ApiConfig::default()
        },
        "/health",
    )
    .unwrap();
    assert!(matches!(probe.probe().await, Err(ProbeError::Unreachable(_))));
}
