//! In-process lock backend: HTTP routes plus the realtime socket.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const TOKEN: &str = "tok-1";
pub const PASSWORD: &str = "hunter2";
pub const BOUND_DEVICE: &str = "smartlock_1";

pub struct FakeBackend {
    pub statuses: Mutex<HashMap<String, Value>>,
    pub commands: Mutex<Vec<(String, String)>>,
    pub socket_frames: Mutex<Vec<String>>,
    /// `Authorization` header of each status and command request, in order.
    pub lock_auth: Mutex<Vec<Option<String>>>,
    pub settings_requests: Mutex<usize>,
    pub settings: Mutex<Value>,
    pub settings_delay: Mutex<Duration>,
    pushes: broadcast::Sender<String>,
}

impl FakeBackend {
    pub fn set_status(&self, device_id: &str, status: Value) {
        self.statuses
            .lock()
            .unwrap()
            .insert(device_id.to_string(), status);
    }

    /// Push a frame to every open socket.
    pub fn push(&self, frame: Value) {
        let _ = self.pushes.send(frame.to_string());
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn socket_frames(&self) -> Vec<String> {
        self.socket_frames.lock().unwrap().clone()
    }

    pub fn lock_auth(&self) -> Vec<Option<String>> {
        self.lock_auth.lock().unwrap().clone()
    }

    pub fn settings_requests(&self) -> usize {
        *self.settings_requests.lock().unwrap()
    }

    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.lock_auth.lock().unwrap().push(value);
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub backend: Arc<FakeBackend>,
}

impl TestServer {
    pub async fn start() -> Self {
        let (pushes, _) = broadcast::channel(16);
        let backend = Arc::new(FakeBackend {
            statuses: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            socket_frames: Mutex::new(Vec::new()),
            lock_auth: Mutex::new(Vec::new()),
            settings_requests: Mutex::new(0),
            settings: Mutex::new(json!({ "notisEnabled": false })),
            settings_delay: Mutex::new(Duration::ZERO),
            pushes,
        });

        let app = Router::new()
            .route("/status/{device_id}", get(status))
            .route("/send-command/{device_id}/{command}", post(send_command))
            .route("/auth/login", post(login))
            .route("/auth/signup", post(signup))
            .route("/settings/{device_id}", get(fetch_settings))
            .route("/settings/{device_id}/user", put(update_setting))
            .route("/ws/client", get(socket))
            .with_state(Arc::clone(&backend));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, backend }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }
}

/// Poll `check` until it holds, failing after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

type Shared = State<Arc<FakeBackend>>;

fn detail(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
}

async fn status(
    State(backend): Shared,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> Json<Value> {
    backend.record_auth(&headers);
    let status = backend
        .statuses
        .lock()
        .unwrap()
        .get(&device_id)
        .cloned()
        .unwrap_or_else(|| json!("UNLOCKED"));
    Json(json!({ "status": status }))
}

async fn send_command(
    State(backend): Shared,
    Path((device_id, command)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    backend.record_auth(&headers);
    if device_id == "offline" {
        return detail(StatusCode::SERVICE_UNAVAILABLE, "Device offline");
    }
    if command != "LOCK" && command != "UNLOCK" {
        return detail(StatusCode::BAD_REQUEST, "Unknown command");
    }
    backend.commands.lock().unwrap().push((device_id, command));
    Json(json!({ "ok": true })).into_response()
}

async fn login(Json(body): Json<Value>) -> Response {
    let email = body["email"].as_str().unwrap_or_default();
    if email == "broken@example.com" {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if body["password"] != PASSWORD {
        return detail(StatusCode::UNAUTHORIZED, "Wrong password");
    }
    Json(json!({
        "user": { "email": email, "device_id": BOUND_DEVICE, "firstName": "Ada" },
        "token": TOKEN,
    }))
    .into_response()
}

async fn signup(Json(body): Json<Value>) -> Response {
    if body["firstName"].as_str().unwrap_or_default().is_empty() {
        return detail(StatusCode::UNPROCESSABLE_ENTITY, "First name is required");
    }
    Json(json!({
        "user": { "email": body["email"], "device_id": null },
        "token": TOKEN,
    }))
    .into_response()
}

async fn fetch_settings(State(backend): Shared, headers: HeaderMap) -> Response {
    *backend.settings_requests.lock().unwrap() += 1;
    if !authorized(&headers) {
        return detail(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    let delay = *backend.settings_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    Json(backend.settings.lock().unwrap().clone()).into_response()
}

async fn update_setting(
    State(backend): Shared,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return detail(StatusCode::UNAUTHORIZED, "Not authenticated");
    }
    let mut settings = backend.settings.lock().unwrap();
    if let (Some(current), Some(changes)) = (settings.as_object_mut(), body.as_object()) {
        for (key, value) in changes {
            current.insert(key.clone(), value.clone());
        }
    }
    Json(json!({ "settings": *settings })).into_response()
}

async fn socket(State(backend): Shared, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| socket_session(socket, backend))
}

async fn socket_session(mut socket: WebSocket, backend: Arc<FakeBackend>) {
    let mut pushes = backend.pushes.subscribe();
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    backend.socket_frames.lock().unwrap().push(text.to_string());
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            push = pushes.recv() => match push {
                Ok(frame) => {
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}
