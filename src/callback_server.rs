//! Authenticated HTTP receiver for worker job events, with event-ID dedup
//! and single-consumer in-process dispatch. Also hosts the small admin
//! surface over the access store, since the bot process that owns chat
//! delivery is the same process that should own chat authorization
//! decisions.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tower_http::validate_request::{ValidateRequest, ValidateRequestHeaderLayer};
use tracing::{Level, event};

use crate::access_store::AccessStore;

const EVENT_ID_CAPACITY: usize = 5000;
const VALID_STATUSES: [&str; 3] = ["done", "failed", "started"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobEvent {
    pub event_id: String,
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub input_url: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub subscribers: Vec<serde_json::Value>,
}

/// Bounded insertion-order set used to recognize already-delivered events.
struct SeenEventIds {
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl SeenEventIds {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(EVENT_ID_CAPACITY),
            members: HashSet::with_capacity(EVENT_ID_CAPACITY),
        }
    }

    /// Returns `true` if `event_id` had already been seen.
    fn mark_seen(&mut self, event_id: &str) -> bool {
        if !self.members.insert(event_id.to_string()) {
            return true;
        }
        self.order.push_back(event_id.to_string());
        if self.order.len() > EVENT_ID_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        false
    }
}

/// Single-consumer event dispatcher: HTTP handlers push accepted events and
/// raise a signal; exactly one background task drains the queue in order.
pub struct EventDispatcher {
    queue: Mutex<VecDeque<JobEvent>>,
    signal: Notify,
}

impl EventDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Notify::new(),
        })
    }

    async fn push(&self, event: JobEvent) {
        self.queue.lock().await.push_back(event);
        self.signal.notify_one();
    }

    /// Runs forever, draining the queue strictly in arrival order and
    /// invoking `handle` for each event. A handler error is logged, not
    /// propagated: one bad event must not stop the consumer.
    pub async fn run<F, Fut>(self: Arc<Self>, handle: F)
    where
        F: Fn(JobEvent) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        loop {
            self.signal.notified().await;
            loop {
                let next = self.queue.lock().await.pop_front();
                let Some(job_event) = next else { break };
                if let Err(err) = handle(job_event.clone()).await {
                    event!(Level::ERROR, "Failed handling callback event job_id={}: {err}", job_event.job_id);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct CallbackServerState {
    pub dispatcher: Arc<EventDispatcher>,
    pub seen_event_ids: Arc<Mutex<SeenEventIds>>,
    pub access: Arc<AccessStore>,
}

impl CallbackServerState {
    pub fn new(dispatcher: Arc<EventDispatcher>, access: Arc<AccessStore>) -> Self {
        Self {
            dispatcher,
            seen_event_ids: Arc::new(Mutex::new(SeenEventIds::new())),
            access,
        }
    }
}

async fn post_job_events(
    State(state): State<CallbackServerState>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let Ok(payload) = serde_json::from_slice::<JobEvent>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": "invalid JSON"})),
        );
    };

    if payload.event_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": "missing event_id"})),
        );
    }

    let status_lower = payload.status.to_ascii_lowercase();
    if !VALID_STATUSES.contains(&status_lower.as_str()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"ok": false, "error": "invalid status"})),
        );
    }

    let already_seen = state.seen_event_ids.lock().await.mark_seen(&payload.event_id);
    if already_seen {
        return (StatusCode::OK, Json(serde_json::json!({"ok": true, "duplicate": true})));
    }

    state.dispatcher.push(payload).await;
    (StatusCode::OK, Json(serde_json::json!({"ok": true})))
}

#[derive(Debug, Deserialize)]
struct AuthorizeChatRequest {
    chat_id: i64,
}

async fn post_authorize(
    State(state): State<CallbackServerState>,
    Json(req): Json<AuthorizeChatRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.access.authorize_chat(req.chat_id) {
        Ok(newly_authorized) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "newly_authorized": newly_authorized}))),
        Err(err) => {
            event!(Level::ERROR, "authorize_chat failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false, "error": "failed to authorize chat"})),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct WhitelistRequest {
    user_ids: Vec<i64>,
}

async fn post_whitelist(
    State(state): State<CallbackServerState>,
    Json(req): Json<WhitelistRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.access.add_users_to_whitelist(&req.user_ids) {
        Ok(newly_added) => (StatusCode::OK, Json(serde_json::json!({"ok": true, "newly_added": newly_added}))),
        Err(err) => {
            event!(Level::ERROR, "add_users_to_whitelist failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false, "error": "failed to update whitelist"})),
            )
        }
    }
}

async fn get_access_snapshot(State(state): State<CallbackServerState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.access.snapshot_counts() {
        Ok(counts) => (StatusCode::OK, Json(serde_json::json!(counts))),
        Err(err) => {
            event!(Level::ERROR, "snapshot_counts failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"ok": false, "error": "failed to read access store"})),
            )
        }
    }
}

/// Validates `X-Internal-Token` against the configured secret by a
/// constant-time comparison.
#[derive(Clone)]
struct InternalTokenValidator {
    token: String,
}

/// Compares two byte strings in time independent of where they first
/// differ. Lengths are allowed to leak (an HTTP header length already does).
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn unauthorized_response() -> Response<Body> {
    let body = serde_json::json!({"ok": false, "error": "unauthorized"}).to_string();
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

impl<B> ValidateRequest<B> for InternalTokenValidator {
    type ResponseBody = Body;

    fn validate(&mut self, request: &mut Request<B>) -> Result<(), Response<Self::ResponseBody>> {
        let provided = request
            .headers()
            .get("X-Internal-Token")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if constant_time_eq(provided.as_bytes(), self.token.as_bytes()) {
            Ok(())
        } else {
            Err(unauthorized_response())
        }
    }
}

/// Builds the router, wrapping every route in a constant-time token check
/// against `X-Internal-Token`.
pub fn router(state: CallbackServerState, token: &str) -> axum::Router {
    axum::Router::new()
        .route("/internal/job-events", post(post_job_events))
        .route("/internal/access/authorize", post(post_authorize))
        .route("/internal/access/whitelist", post(post_whitelist))
        .route("/internal/access/snapshot", axum::routing::get(get_access_snapshot))
        .layer(ValidateRequestHeaderLayer::custom(InternalTokenValidator {
            token: token.to_string(),
        }))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_event_ids_detects_duplicates_and_evicts_oldest() {
        let mut seen = SeenEventIds::new();
        assert!(!seen.mark_seen("a"));
        assert!(seen.mark_seen("a"));

        for i in 0..EVENT_ID_CAPACITY {
            seen.mark_seen(&format!("evt-{i}"));
        }
        assert!(!seen.members.contains("a"));
    }

    #[tokio::test]
    async fn dispatcher_drains_events_in_arrival_order() {
        let dispatcher = EventDispatcher::new();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let consumer_observed = observed.clone();
        let consumer_dispatcher = dispatcher.clone();
        let consumer = tokio::spawn(async move {
            consumer_dispatcher
                .run(move |event| {
                    let observed = consumer_observed.clone();
                    async move {
                        observed.lock().await.push(event.job_id);
                        Ok(())
                    }
                })
                .await;
        });

        dispatcher
            .push(JobEvent {
                event_id: "e1".to_string(),
                job_id: "job-1".to_string(),
                status: "started".to_string(),
                platform: None,
                input_url: None,
                result: None,
                error: None,
                subscribers: vec![],
            })
            .await;
        dispatcher
            .push(JobEvent {
                event_id: "e2".to_string(),
                job_id: "job-2".to_string(),
                status: "done".to_string(),
                platform: None,
                input_url: None,
                result: None,
                error: None,
                subscribers: vec![],
            })
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        consumer.abort();

        let got = observed.lock().await.clone();
        assert_eq!(got, vec!["job-1".to_string(), "job-2".to_string()]);
    }

    fn test_state(dir: &std::path::Path) -> CallbackServerState {
        let access = Arc::new(AccessStore::new(
            dir.join("authorized_chats.json"),
            dir.join("whitelist.txt"),
            dir.join(".access.lock"),
        ));
        CallbackServerState::new(EventDispatcher::new(), access)
    }

    #[tokio::test]
    async fn admin_routes_reject_missing_token() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()), "s3cr3t");

        let response = app
            .oneshot(Request::builder().uri("/internal/access/snapshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authorize_then_whitelist_then_snapshot_roundtrips() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()), "s3cr3t");

        let authorize_body = serde_json::json!({"chat_id": 42});
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/internal/access/authorize")
                    .header("content-type", "application/json")
                    .header("X-Internal-Token", "s3cr3t")
                    .body(Body::from(authorize_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let whitelist_body = serde_json::json!({"user_ids": [7, 8]});
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/internal/access/whitelist")
                    .header("content-type", "application/json")
                    .header("X-Internal-Token", "s3cr3t")
                    .body(Body::from(whitelist_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["newly_added"], 2);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/internal/access/snapshot")
                    .header("X-Internal-Token", "s3cr3t")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["authorized_chats"], 1);
        assert_eq!(parsed["whitelisted_users"], 2);
    }
}
