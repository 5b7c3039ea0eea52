//! HTTP surface that validates inputs and calls into `JobStore`.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tracing::{Level, event};

use crate::job_store::{EnqueueRow, JobStore, SubscriberInput};
use crate::url_classifier::{self, Platform};

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberRequest {
    pub chat_id: i64,
    pub message_id: i64,
    #[allow(dead_code)]
    pub chat_type: String,
    pub thread_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub urls: Vec<String>,
    pub subscriber: SubscriberRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponseRow {
    pub input_url: String,
    pub normalized_url: String,
    pub platform: Platform,
    pub job_id: String,
    pub status: String,
    pub deduplicated: bool,
}

impl From<EnqueueRow> for EnqueueResponseRow {
    fn from(row: EnqueueRow) -> Self {
        Self {
            input_url: row.input_url,
            normalized_url: row.normalized_url,
            platform: row.platform,
            job_id: row.job_id,
            status: row.status.to_string(),
            deduplicated: row.deduplicated,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub ok: bool,
    pub jobs: Vec<EnqueueResponseRow>,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub platform: Platform,
    pub input_url: String,
    pub normalized_url: String,
    pub result: Option<crate::downloader::DownloadResult>,
    pub error: Option<String>,
    pub subscribers_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { detail: detail.into() }))
}

#[derive(Clone)]
pub struct EnqueueApiState {
    pub store: Arc<JobStore>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn post_jobs(
    State(state): State<EnqueueApiState>,
    Json(payload): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, (StatusCode, Json<ErrorBody>)> {
    let classified = url_classifier::classify_unique(&payload.urls);
    if classified.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "No supported URLs found"));
    }
    if payload.subscriber.chat_type.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "chat_type must not be empty"));
    }

    let subscriber = SubscriberInput {
        chat_id: payload.subscriber.chat_id,
        message_id: payload.subscriber.message_id,
        thread_id: payload.subscriber.thread_id,
    };

    let rows = state.store.enqueue_many(&classified, &subscriber).map_err(|err| {
        event!(Level::ERROR, "enqueue_many failed: {err}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to enqueue jobs")
    })?;

    event!(Level::INFO, "Enqueued jobs count={}", rows.len());
    Ok(Json(EnqueueResponse {
        ok: true,
        jobs: rows.into_iter().map(EnqueueResponseRow::from).collect(),
    }))
}

async fn get_job(
    State(state): State<EnqueueApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, (StatusCode, Json<ErrorBody>)> {
    let job = state
        .store
        .get_job(&job_id)
        .map_err(|err| {
            event!(Level::ERROR, "get_job failed job_id={job_id}: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to look up job")
        })?
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "Job not found"))?;

    Ok(Json(JobResponse {
        job_id: job.job_id,
        status: job.status.to_string(),
        attempts: job.attempts,
        max_attempts: job.max_attempts,
        platform: job.platform,
        input_url: job.input_url,
        normalized_url: job.normalized_url,
        result: job.result,
        error: job.error,
        subscribers_count: job.subscribers.len(),
    }))
}

pub fn router(state: EnqueueApiState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route("/jobs", post(post_jobs))
        .route("/jobs/{job_id}", get(get_job))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> EnqueueApiState {
        EnqueueApiState {
            store: Arc::new(JobStore::new(
                dir.join("queue.jsonl"),
                dir.join("results.jsonl"),
                dir.join(".queue.lock"),
                2,
                1000,
            )),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_jobs_rejects_unsupported_urls() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let body = serde_json::json!({
            "urls": ["https://youtube.com/watch?v=abc"],
            "subscriber": {"chat_id": 1, "message_id": 1, "chat_type": "private", "thread_id": null},
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn post_jobs_rejects_empty_chat_type() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let body = serde_json::json!({
            "urls": ["https://instagram.com/reel/ABC123/"],
            "subscriber": {"chat_id": 1, "message_id": 1, "chat_type": "", "thread_id": null},
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn post_jobs_then_get_job_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let body = serde_json::json!({
            "urls": ["https://instagram.com/reel/ABC123/"],
            "subscriber": {"chat_id": 1, "message_id": 10, "chat_type": "private", "thread_id": null},
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: EnqueueResponse = serde_json::from_slice(&bytes).unwrap();
        let job_id = parsed.jobs[0].job_id.clone();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/jobs/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
