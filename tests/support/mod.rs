//! In-process mock of the analysis backend for integration tests.
//!
//! Starts a real Axum server on a random port. Tests script responses
//! through [`MockApi`] and inspect what the client sent afterwards.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};

use tonpixo::backend::{FallbackRequest, PersistedMessage, SessionInit, StreamRequest};

pub const FRIENDLY: &str = "EQCD39VS5jcptHL8vMjEXrzGaRcCVYto7HUn4bpAOg8xqB2N";
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted backend state.
pub struct MockApi {
    pub summaries: Mutex<HashMap<String, Value>>,
    pub summary_calls: AtomicUsize,
    /// Per job; the last status repeats.
    pub statuses: Mutex<HashMap<String, VecDeque<Value>>>,
    pub submitted: Mutex<Vec<Value>>,
    pub cancelled: Mutex<Vec<String>>,
    pub inits: Mutex<Vec<SessionInit>>,
    pub messages: Mutex<Vec<(String, PersistedMessage)>>,
    pub stream_requests: Mutex<Vec<StreamRequest>>,
    pub stream_status: Mutex<StatusCode>,
    pub stream_chunks: Mutex<Vec<String>>,
    pub fallback_requests: Mutex<Vec<FallbackRequest>>,
    pub fallback: Mutex<Value>,
    next_job: AtomicUsize,
}

impl Default for MockApi {
    fn default() -> Self {
        Self {
            summaries: Mutex::new(HashMap::new()),
            summary_calls: AtomicUsize::new(0),
            statuses: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            inits: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            stream_requests: Mutex::new(Vec::new()),
            stream_status: Mutex::new(StatusCode::OK),
            stream_chunks: Mutex::new(Vec::new()),
            fallback_requests: Mutex::new(Vec::new()),
            fallback: Mutex::new(json!({"answer": "fallback answer"})),
            next_job: AtomicUsize::new(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockApi {
    pub fn set_summary(&self, address: &str, body: Value) {
        lock(&self.summaries).insert(address.to_string(), body);
    }

    pub fn push_statuses(&self, job_id: &str, statuses: impl IntoIterator<Item = Value>) {
        lock(&self.statuses)
            .entry(job_id.to_string())
            .or_default()
            .extend(statuses);
    }

    pub fn set_stream(&self, status: StatusCode, chunks: &[&str]) {
        *lock(&self.stream_status) = status;
        *lock(&self.stream_chunks) = chunks.iter().map(|c| c.to_string()).collect();
    }

    pub fn set_fallback(&self, body: Value) {
        *lock(&self.fallback) = body;
    }

    pub fn submitted(&self) -> Vec<Value> {
        lock(&self.submitted).clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    pub fn inits(&self) -> Vec<SessionInit> {
        lock(&self.inits).clone()
    }

    pub fn messages(&self) -> Vec<(String, PersistedMessage)> {
        lock(&self.messages).clone()
    }

    pub fn stream_requests(&self) -> Vec<StreamRequest> {
        lock(&self.stream_requests).clone()
    }

    pub fn fallback_requests(&self) -> Vec<FallbackRequest> {
        lock(&self.fallback_requests).clone()
    }
}

async fn account(State(api): State<Arc<MockApi>>, Path(address): Path<String>) -> Json<Value> {
    api.summary_calls.fetch_add(1, Ordering::SeqCst);
    let body = lock(&api.summaries)
        .get(&address)
        .cloned()
        .unwrap_or_else(|| json!({"error": "Account not found"}));
    Json(body)
}

async fn generate(State(api): State<Arc<MockApi>>, Json(body): Json<Value>) -> Json<Value> {
    lock(&api.submitted).push(body);
    let n = api.next_job.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"job_id": format!("job-{n}")}))
}

async fn status(State(api): State<Arc<MockApi>>, Path(job_id): Path<String>) -> Response {
    let mut statuses = lock(&api.statuses);
    let Some(queue) = statuses.get_mut(&job_id) else {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "Job not found"}))).into_response();
    };
    let next = if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    };
    Json(next.unwrap_or_else(|| json!({"status": "queued"}))).into_response()
}

async fn cancel(State(api): State<Arc<MockApi>>, Path(job_id): Path<String>) -> Json<Value> {
    lock(&api.cancelled).push(job_id);
    Json(json!({"status": "cancelled"}))
}

async fn init_chat(State(api): State<Arc<MockApi>>, Json(init): Json<SessionInit>) -> StatusCode {
    lock(&api.inits).push(init);
    StatusCode::CREATED
}

async fn append_message(
    State(api): State<Arc<MockApi>>,
    Path(session_id): Path<String>,
    Json(message): Json<PersistedMessage>,
) -> Json<Value> {
    lock(&api.messages).push((session_id, message));
    Json(json!({"ok": true}))
}

async fn stream(State(api): State<Arc<MockApi>>, Json(request): Json<StreamRequest>) -> Response {
    lock(&api.stream_requests).push(request);
    let status = *lock(&api.stream_status);
    if !status.is_success() {
        return (status, "stream unavailable").into_response();
    }
    let chunks: Vec<Result<String, Infallible>> =
        lock(&api.stream_chunks).iter().cloned().map(Ok).collect();
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn fallback(
    State(api): State<Arc<MockApi>>,
    Json(request): Json<FallbackRequest>,
) -> Json<Value> {
    lock(&api.fallback_requests).push(request);
    Json(lock(&api.fallback).clone())
}

fn is_bind_permission_error<E: std::fmt::Display>(err: &E) -> bool {
    err.to_string().contains("Operation not permitted")
        || err.to_string().contains("Permission denied")
}

/// Start the mock on a random port. `None` when the sandbox forbids binding.
pub async fn start_mock_backend() -> Option<(SocketAddr, Arc<MockApi>)> {
    let api = Arc::new(MockApi::default());
    let app = Router::new()
        .route("/api/account/{address}", get(account))
        .route("/api/generate", post(generate))
        .route("/api/status/{job_id}", get(status))
        .route("/api/cancel/{job_id}", post(cancel))
        .route("/api/chats", post(init_chat))
        .route("/api/chats/{session_id}/messages", post(append_message))
        .route("/api/chat/stream", post(stream))
        .route("/api/chat", post(fallback))
        .with_state(Arc::clone(&api));

    let listener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) if is_bind_permission_error(&e) => return None,
        Err(e) => panic!("Failed to bind mock backend: {e}"),
    };
    let addr = listener.local_addr().ok()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Some((addr, api))
}

/// Poll `check` every 10ms until it holds or [`TIMEOUT`] passes.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
