//! Mock API server lifecycle management
//!
//! Spawns an in-process axum server implementing the job-result endpoint,
//! a paginated collection, a rate-limited endpoint, the push channel auth
//! endpoint and the WebSocket push channel. Each test gets its own instance.

use super::constants::*;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use job_result_client::subscription::{events, PUSH_PAYLOAD_LIMIT_BYTES};
use job_result_client::{Client, ClientConfig};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Scripted answer of the job-result endpoint.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Reply {
    NotFound,
    Pending,
    Completed(Value),
    Failed(Value),
    Status(u16),
}

struct MockState {
    jobs: Mutex<HashMap<String, VecDeque<Reply>>>,
    hits: Mutex<HashMap<String, usize>>,
    next_job_id: AtomicUsize,

    items: Mutex<Vec<Value>>,
    items_fail_at: Mutex<Option<u64>>,
    items_in_flight: AtomicUsize,
    items_max_in_flight: AtomicUsize,

    limited_hits: Mutex<Vec<Instant>>,

    reject_auth: AtomicBool,
    auth_calls: AtomicUsize,
    ws_connections: AtomicUsize,
    open_sockets: AtomicUsize,
    pongs: AtomicUsize,
    channel: Mutex<Option<String>>,
    push_tx: broadcast::Sender<String>,
}

impl MockState {
    fn new() -> Self {
        let (push_tx, _) = broadcast::channel(64);
        Self {
            jobs: Mutex::new(HashMap::new()),
            hits: Mutex::new(HashMap::new()),
            next_job_id: AtomicUsize::new(1),
            items: Mutex::new(Vec::new()),
            items_fail_at: Mutex::new(None),
            items_in_flight: AtomicUsize::new(0),
            items_max_in_flight: AtomicUsize::new(0),
            limited_hits: Mutex::new(Vec::new()),
            reject_auth: AtomicBool::new(false),
            auth_calls: AtomicUsize::new(0),
            ws_connections: AtomicUsize::new(0),
            open_sockets: AtomicUsize::new(0),
            pongs: AtomicUsize::new(0),
            channel: Mutex::new(None),
            push_tx,
        }
    }

    fn record_hit(&self, path: &str) {
        *self.hits.lock().unwrap().entry(path.to_string()).or_default() += 1;
    }

    /// Next scripted reply for `job_id`; the last reply repeats.
    fn next_reply(&self, job_id: &str) -> Reply {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(job_id) {
            None => Reply::NotFound,
            Some(replies) if replies.len() > 1 => replies.pop_front().unwrap(),
            Some(replies) => replies.front().cloned().unwrap_or(Reply::NotFound),
        }
    }
}

/// Mock API instance
///
/// When dropped, the server shuts down.
pub struct MockApi {
    /// Base URL for REST requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// URL of the WebSocket push channel
    pub ws_url: String,

    /// URL of the push channel auth endpoint
    pub auth_endpoint: String,

    state: Arc<MockState>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl MockApi {
    /// Spawns a new mock API on a random port
    pub async fn spawn() -> Self {
        let state = Arc::new(MockState::new());

        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/job-results/{id}", get(job_result))
            .route(JOBS_PATH, post(start_job))
            .route(ITEMS_PATH, get(list_items))
            .route(LIMITED_PATH, get(limited))
            .route(PUSH_AUTH_PATH, post(authorize))
            .route(PUSH_WS_PATH, get(push_socket))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        let base_url = format!("http://127.0.0.1:{}", port);
        let server = Self {
            ws_url: format!("ws://127.0.0.1:{}{}", port, PUSH_WS_PATH),
            auth_endpoint: format!("{}{}", base_url, PUSH_AUTH_PATH),
            base_url,
            state,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;
        server
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .expect("Failed to build reqwest client");

        let start = Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }

    /// Client configuration pointing at this server, with short delays.
    pub fn config(&self, push: bool) -> ClientConfig {
        let mut config = ClientConfig::new(self.base_url.clone(), TEST_TOKEN);
        config.request_timeout_secs = 5;
        config.retry.initial_delay_ms = 20;
        config.retry.max_delay_ms = 200;
        config.jobs.push_wait_timeout_secs = 10;
        config.jobs.poll_head_start_ms = 200;
        config.jobs.poll_interval_ms = 50;
        config.jobs.max_poll_attempts = 100;
        config.push.enabled = push;
        config.push.ws_url = Some(self.ws_url.clone());
        config.push.auth_endpoint = Some(self.auth_endpoint.clone());
        config.pagination.page_size = 10;
        config
    }

    pub fn client(&self, push: bool) -> Client {
        Client::from_config(self.config(push)).expect("Failed to build client")
    }

    /// Script the replies of `GET /job-results/{job_id}`.
    pub fn script_job(&self, job_id: &str, replies: Vec<Reply>) {
        self.state
            .jobs
            .lock()
            .unwrap()
            .insert(job_id.to_string(), replies.into());
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn job_hits(&self, job_id: &str) -> usize {
        self.hits(&format!("/job-results/{}", job_id))
    }

    pub fn set_items(&self, items: Vec<Value>) {
        *self.state.items.lock().unwrap() = items;
    }

    /// Make the items page starting at `offset` fail with 422.
    pub fn fail_items_at(&self, offset: u64) {
        *self.state.items_fail_at.lock().unwrap() = Some(offset);
    }

    pub fn items_max_in_flight(&self) -> usize {
        self.state.items_max_in_flight.load(Ordering::SeqCst)
    }

    pub fn limited_hits(&self) -> Vec<Instant> {
        self.state.limited_hits.lock().unwrap().clone()
    }

    pub fn reject_auth(&self) {
        self.state.reject_auth.store(true, Ordering::SeqCst);
    }

    pub fn auth_calls(&self) -> usize {
        self.state.auth_calls.load(Ordering::SeqCst)
    }

    /// Number of push connections opened so far
    pub fn ws_connections(&self) -> usize {
        self.state.ws_connections.load(Ordering::SeqCst)
    }

    /// Number of push connections currently subscribed
    pub fn open_sockets(&self) -> usize {
        self.state.open_sockets.load(Ordering::SeqCst)
    }

    pub fn pongs(&self) -> usize {
        self.state.pongs.load(Ordering::SeqCst)
    }

    /// Push a job-result event to every subscribed connection.
    ///
    /// Payloads above the push limit are elided and flagged, as the real
    /// service does. Returns the number of connections reached.
    pub fn push_job_result(&self, mut record: Value) -> usize {
        let too_large = record
            .get("payload")
            .map(|payload| payload.to_string().len() > PUSH_PAYLOAD_LIMIT_BYTES)
            .unwrap_or(false);
        if too_large {
            record.as_object_mut().unwrap().remove("payload");
            record["payload_too_large"] = json!(true);
        }

        let channel = self.state.channel.lock().unwrap().clone().unwrap_or_default();
        let frame = json!({
            "event": events::JOB_RESULT,
            "channel": channel,
            "data": record.to_string(),
        });
        self.state.push_tx.send(frame.to_string()).unwrap_or(0)
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn error_document(code: &str) -> Value {
    json!({
        "data": [{
            "id": "err-1",
            "type": "api_error",
            "attributes": { "code": code, "details": {} }
        }]
    })
}

async fn job_result(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    state.record_hit(&format!("/job-results/{}", id));

    match state.next_reply(&id) {
        Reply::NotFound => {
            (StatusCode::NOT_FOUND, Json(error_document("NOT_FOUND"))).into_response()
        }
        Reply::Pending => Json(json!({ "id": id, "status": "pending" })).into_response(),
        Reply::Completed(payload) => Json(json!({
            "data": {
                "id": id,
                "type": "job_result",
                "attributes": { "status": "completed", "payload": payload }
            }
        }))
        .into_response(),
        Reply::Failed(error) => {
            Json(json!({ "id": id, "status": "failed", "error": error })).into_response()
        }
        Reply::Status(code) => (
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Json(error_document("SCRIPTED")),
        )
            .into_response(),
    }
}

/// Start a job that completes after a missing record and one pending poll.
async fn start_job(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.record_hit(JOBS_PATH);
    let id = format!("job-{}", state.next_job_id.fetch_add(1, Ordering::SeqCst));
    state.jobs.lock().unwrap().insert(
        id.clone(),
        VecDeque::from(vec![
            Reply::NotFound,
            Reply::Pending,
            Reply::Completed(json!({ "processed": body })),
        ]),
    );
    (
        StatusCode::ACCEPTED,
        Json(json!({ "data": { "type": "job", "id": id } })),
    )
        .into_response()
}

async fn list_items(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.record_hit(ITEMS_PATH);
    let offset: u64 = params
        .get("page[offset]")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let limit: u64 = params
        .get("page[limit]")
        .and_then(|v| v.parse().ok())
        .unwrap_or(30)
        .max(1);

    let now = state.items_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.items_max_in_flight.fetch_max(now, Ordering::SeqCst);
    // Uneven latency so later pages often finish first
    let page_index = offset / limit;
    tokio::time::sleep(Duration::from_millis(5 + (page_index * 37 % 7) * 10)).await;
    state.items_in_flight.fetch_sub(1, Ordering::SeqCst);

    if *state.items_fail_at.lock().unwrap() == Some(offset) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(error_document("INVALID_FIELD")),
        )
            .into_response();
    }

    let items = state.items.lock().unwrap();
    let total = items.len() as u64;
    let start = offset.min(total) as usize;
    let end = (offset + limit).min(total) as usize;
    Json(json!({
        "data": items[start..end],
        "meta": { "total_count": total }
    }))
    .into_response()
}

/// Rate-limited on the first call, fine afterwards.
async fn limited(State(state): State<Arc<MockState>>) -> Response {
    state.record_hit(LIMITED_PATH);
    let first = {
        let mut hits = state.limited_hits.lock().unwrap();
        hits.push(Instant::now());
        hits.len() == 1
    };

    if first {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "1")],
            Json(error_document("RATE_LIMITED")),
        )
            .into_response()
    } else {
        Json(json!({ "ok": true })).into_response()
    }
}

fn signature(socket_id: &str, channel: &str) -> String {
    format!("{}:{}:{}", PUSH_APP_KEY, socket_id, channel)
}

async fn authorize(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    state.auth_calls.fetch_add(1, Ordering::SeqCst);

    let expected = format!("Bearer {}", TEST_TOKEN);
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(expected.as_str());
    if !authorized || state.reject_auth.load(Ordering::SeqCst) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let socket_id = request["socket_id"].as_str().unwrap_or_default();
    let channel = request["channel_name"].as_str().unwrap_or_default();
    Json(json!({ "auth": signature(socket_id, channel) })).into_response()
}

async fn push_socket(ws: WebSocketUpgrade, State(state): State<Arc<MockState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<MockState>) {
    let connection = state.ws_connections.fetch_add(1, Ordering::SeqCst) + 1;
    let socket_id = format!("{}.{}", connection, connection * 7);
    let (mut sink, mut stream) = socket.split();

    let established = json!({
        "event": events::CONNECTION_ESTABLISHED,
        "data": json!({ "socket_id": socket_id, "activity_timeout": 120 }).to_string(),
    });
    if sink
        .send(Message::Text(established.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    // Wait for a correctly signed subscribe frame
    let channel = loop {
        let Some(Ok(message)) = stream.next().await else {
            return;
        };
        let Message::Text(text) = message else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
        if frame["event"] != events::SUBSCRIBE {
            continue;
        }
        let channel = frame["data"]["channel"].as_str().unwrap_or_default().to_string();
        if frame["data"]["auth"].as_str() != Some(signature(&socket_id, &channel).as_str()) {
            let error = json!({
                "event": events::ERROR,
                "data": { "message": "Invalid signature", "code": 4009 }
            });
            let _ = sink.send(Message::Text(error.to_string().into())).await;
            return;
        }
        break channel;
    };

    let mut pushes = state.push_tx.subscribe();
    *state.channel.lock().unwrap() = Some(channel.clone());
    let succeeded = json!({
        "event": events::SUBSCRIPTION_SUCCEEDED,
        "channel": channel,
        "data": "{}",
    });
    let ping = json!({ "event": events::PING, "data": {} });
    for frame in [succeeded, ping] {
        if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
            return;
        }
    }
    state.open_sockets.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            pushed = pushes.recv() => match pushed {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
                    if frame["event"] == events::PONG {
                        state.pongs.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.open_sockets.fetch_sub(1, Ordering::SeqCst);
}
