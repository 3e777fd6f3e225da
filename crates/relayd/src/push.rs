//! HTTP ingress for inbound messages.
//!
//! A single POST endpoint guarded, in order, by routing, bearer auth, a
//! per-second rate limit, an in-flight request cap, a body-size limit and
//! schema validation, then handed to the bounded queue. `/health` and
//! `/ready` expose the health source.

use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use common::config::PushConfig;
use common::time::now_ms;
use common::types::InboundMessage;

use crate::queue::EnqueueError;

/// Bodies above this size are rejected mid-read; nothing is enqueued and
/// no callback ever fires for them.
pub const MAX_BODY_BYTES: usize = 15 * 1024 * 1024;

/// Destination for validated messages; the work queue in production.
pub trait MessageSink: Send + Sync {
    fn accept(&self, message: InboundMessage) -> Result<(), EnqueueError>;
}

impl MessageSink for crate::queue::WorkQueue {
    fn accept(&self, message: InboundMessage) -> Result<(), EnqueueError> {
        self.enqueue(message)
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub trait HealthSource: Send + Sync {
    fn health(&self) -> HealthReport;
}

/// Wall-clock-second token window for the ingress rate limit.
pub struct SecondWindow {
    limit: u32,
    state: Mutex<(u64, u32)>,
}

impl SecondWindow {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            state: Mutex::new((0, 0)),
        }
    }

    pub fn allow(&self, now_ms: u64) -> bool {
        let second = now_ms / 1_000;
        let mut state = self.lock_state();
        if state.0 != second {
            *state = (second, 0);
        }
        if state.1 >= self.limit {
            return false;
        }
        state.1 += 1;
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, (u64, u32)> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone)]
pub struct PushServerState {
    token: Arc<String>,
    sink: Arc<dyn MessageSink>,
    health: Arc<dyn HealthSource>,
    rate: Arc<SecondWindow>,
    slots: Arc<Semaphore>,
}

impl PushServerState {
    pub fn new(
        config: &PushConfig,
        token: String,
        sink: Arc<dyn MessageSink>,
        health: Arc<dyn HealthSource>,
    ) -> Self {
        Self {
            token: Arc::new(token),
            sink,
            health,
            rate: Arc::new(SecondWindow::new(config.rate_limit_per_second)),
            slots: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
        }
    }
}

pub fn build_router(config: &PushConfig, state: PushServerState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route(&config.path, post(push_handler))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

async fn push_handler(
    State(state): State<PushServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !bearer_matches(&headers, &state.token) {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "missing or invalid bearer token",
            None,
        );
    }

    if !state.rate.allow(now_ms()) {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "push rate limit exceeded",
            None,
        );
    }

    let Ok(_permit) = state.slots.try_acquire() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "BUSY",
            "too many concurrent push requests",
            None,
        );
    };

    let message = match parse_inbound(&body) {
        Ok(message) => message,
        Err(detail) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "request body does not match the inbound message schema",
                Some(json!({"error": detail})),
            );
        }
    };

    tracing::debug!(message_id = %message.message_id, "inbound message accepted for queueing");
    match state.sink.accept(message) {
        Ok(()) => (StatusCode::OK, Json(json!({"accepted": true}))).into_response(),
        Err(EnqueueError::QueueClosed) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "SHUTTING_DOWN",
            "relay is shutting down",
            None,
        ),
        Err(EnqueueError::QueueFull { max_queue }) => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "QUEUE_FULL",
            "relay queue is full",
            Some(json!({"maxQueue": max_queue})),
        ),
    }
}

async fn health_handler(State(state): State<PushServerState>) -> Response {
    let report = state.health.health();
    let status = if report.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health_body(&report))).into_response()
}

async fn ready_handler(State(state): State<PushServerState>) -> Response {
    let report = state.health.health();
    let status = if report.ok && report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health_body(&report))).into_response()
}

async fn not_found_handler() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "NOT_FOUND",
        "no such endpoint",
        None,
    )
}

fn health_body(report: &HealthReport) -> Value {
    let mut body = json!({
        "status": if report.ok { "ok" } else { "degraded" },
        "ok": report.ok,
        "ready": report.ready,
    });
    if let Some(details) = &report.details {
        body["details"] = details.clone();
    }
    body
}

fn parse_inbound(body: &Bytes) -> Result<InboundMessage, String> {
    serde_json::from_slice(body).map_err(|err| err.to_string())
}

fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(value) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(provided) = value.strip_prefix("Bearer ") else {
        return false;
    };
    constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    details: Option<Value>,
) -> Response {
    let mut body = json!({"code": code, "message": message});
    if let Some(details) = details {
        body["details"] = details;
    }
    (status, Json(body)).into_response()
}
