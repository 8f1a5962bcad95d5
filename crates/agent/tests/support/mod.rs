//! In-process stand-in for the coordinator: token endpoints, manifest,
//! configuration, file content and the Socket.IO control plane.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::manifest::encode_file_list;
use common::prelude::{create_hmac_sha256, FileInfo, FileList};
use parking_lot::Mutex;
use serde_json::{json, Value};
use url::Url;

pub const CLUSTER_ID: &str = "cluster-1";
pub const SECRET: &str = "cluster-secret";
pub const CHALLENGE: &str = "challenge-1";

pub struct FakeState {
    pub token_ttl_ms: u64,
    pub issued: AtomicUsize,
    pub refreshed: AtomicUsize,
    pub fail_refresh: AtomicBool,
    pub failed_refreshes: AtomicUsize,
    pub files: Mutex<Vec<FileInfo>>,
    pub contents: Mutex<HashMap<String, Bytes>>,
    pub downloads: AtomicUsize,
    pub download_delay_ms: AtomicU64,
    pub in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
    pub sync_concurrency: AtomicUsize,
    pub list_queries: Mutex<Vec<Option<String>>>,
    pub events: Mutex<Vec<(String, Value)>>,
    pub keepalive_reply: Mutex<Value>,
    pub enable_reply: Mutex<Value>,
    pub connections: AtomicUsize,
}

impl FakeState {
    fn token(&self) -> String {
        format!("token-{}", self.issued.load(Ordering::SeqCst))
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|t| t.starts_with("token-"))
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events.lock().iter().map(|(name, _)| name.clone()).collect()
    }
}

pub struct FakeCoordinator {
    pub url: Url,
    pub state: Arc<FakeState>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for FakeCoordinator {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl FakeCoordinator {
    pub async fn start(token_ttl_ms: u64) -> Self {
        let state = Arc::new(FakeState {
            token_ttl_ms,
            issued: AtomicUsize::new(0),
            refreshed: AtomicUsize::new(0),
            fail_refresh: AtomicBool::new(false),
            failed_refreshes: AtomicUsize::new(0),
            files: Mutex::new(Vec::new()),
            contents: Mutex::new(HashMap::new()),
            downloads: AtomicUsize::new(0),
            download_delay_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            sync_concurrency: AtomicUsize::new(4),
            list_queries: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            keepalive_reply: Mutex::new(json!([null, "2024-01-01T00:00:00.000Z"])),
            enable_reply: Mutex::new(json!([null, true])),
            connections: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route("/openbmclapi-agent/challenge", get(challenge))
            .route("/openbmclapi-agent/token", post(token))
            .route("/openbmclapi/files", get(files))
            .route("/openbmclapi/configuration", get(configuration))
            .route("/socket.io/", get(socket))
            .fallback(content)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            url: Url::parse(&format!("http://{}", addr)).unwrap(),
            state,
            server,
        }
    }

    /// Publish a file in the manifest with the given content.
    pub fn publish(&self, file: FileInfo, content: &'static [u8]) {
        self.state
            .contents
            .lock()
            .insert(file.path.clone(), Bytes::from_static(content));
        self.state.files.lock().push(file);
    }
}

async fn challenge(Query(query): Query<HashMap<String, String>>) -> Response {
    if query.get("clusterId").map(String::as_str) != Some(CLUSTER_ID) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(json!({ "challenge": CHALLENGE })).into_response()
}

async fn token(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Response {
    if body["clusterId"] != CLUSTER_ID {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if let Some(signature) = body["signature"].as_str() {
        if body["challenge"] != CHALLENGE || signature != create_hmac_sha256(SECRET, CHALLENGE) {
            return (StatusCode::FORBIDDEN, "bad signature").into_response();
        }
    } else if body["token"].as_str().is_some_and(|t| t.starts_with("token-")) {
        if state.fail_refresh.load(Ordering::SeqCst) {
            state.failed_refreshes.fetch_add(1, Ordering::SeqCst);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        state.refreshed.fetch_add(1, Ordering::SeqCst);
    } else {
        return StatusCode::FORBIDDEN.into_response();
    }

    state.issued.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "token": state.token(), "ttl": state.token_ttl_ms })).into_response()
}

async fn files(
    State(state): State<Arc<FakeState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let since = query.get("lastModified").cloned();
    state.list_queries.lock().push(since.clone());

    let since: i64 = since.and_then(|s| s.parse().ok()).unwrap_or(i64::MIN);
    let files: Vec<FileInfo> = state
        .files
        .lock()
        .iter()
        .filter(|f| f.mtime > since)
        .cloned()
        .collect();
    if files.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }

    let body = encode_file_list(&FileList::new(files)).unwrap();
    ([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response()
}

async fn configuration(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let concurrency = state.sync_concurrency.load(Ordering::SeqCst);
    Json(json!({ "sync": { "source": "center", "concurrency": concurrency } })).into_response()
}

async fn content(State(state): State<Arc<FakeState>>, headers: HeaderMap, uri: Uri) -> Response {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    state.downloads.fetch_add(1, Ordering::SeqCst);

    let running = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_in_flight.fetch_max(running, Ordering::SeqCst);
    let delay = state.download_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    state.in_flight.fetch_sub(1, Ordering::SeqCst);

    let content = state.contents.lock().get(uri.path()).cloned();
    match content {
        Some(bytes) => bytes.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn socket(State(state): State<Arc<FakeState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| control_session(socket, state))
}

async fn control_session(mut socket: WebSocket, state: Arc<FakeState>) {
    let open = r#"0{"sid":"fake-sid","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
    if socket.send(Message::Text(open.to_string())).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            if matches!(message, Message::Close(_)) {
                break;
            }
            continue;
        };

        if let Some(auth) = text.strip_prefix("40") {
            let auth: Value = serde_json::from_str(auth).unwrap_or(Value::Null);
            let reply = if auth["token"].as_str().is_some_and(|t| t.starts_with("token-")) {
                state.connections.fetch_add(1, Ordering::SeqCst);
                r#"40{"sid":"socket-sid"}"#.to_string()
            } else {
                r#"44{"message":"invalid token"}"#.to_string()
            };
            let _ = socket.send(Message::Text(reply)).await;
            continue;
        }
        if text == "41" {
            break;
        }

        if let Some(event) = text.strip_prefix("42") {
            let digits = event.chars().take_while(|c| c.is_ascii_digit()).count();
            let id = &event[..digits];
            let payload: Vec<Value> = serde_json::from_str(&event[digits..]).unwrap_or_default();
            let name = payload.first().and_then(Value::as_str).unwrap_or_default().to_string();
            let data = payload.get(1).cloned().unwrap_or(Value::Null);
            state.events.lock().push((name.clone(), data));

            let result = match name.as_str() {
                "enable" => state.enable_reply.lock().clone(),
                "keep-alive" => state.keepalive_reply.lock().clone(),
                "request-cert" => json!([null, { "cert": "CERT", "key": "KEY" }]),
                _ => json!([{ "message": "unknown event" }]),
            };
            let ack = format!("43{}{}", id, json!([result]));
            let _ = socket.send(Message::Text(ack)).await;
        }
    }
}

pub fn file(path: &str, hash: &str, size: u64, mtime: i64) -> FileInfo {
    FileInfo {
        path: path.to_string(),
        hash: hash.to_string(),
        size,
        mtime,
    }
}
