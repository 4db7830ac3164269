//! Browser bridge: local event-push server for the browser extension.
//!
//! The extension holds one SSE connection to `GET /sse` and posts command
//! results to `POST /result`. Commands from the Hub are pushed as `command`
//! events and matched back to their waiters through a correlation table of
//! single-shot channels. The bridge outlives session attempts: it is owned
//! by the supervisor so the local port is bound once, and it holds a
//! swappable link to the current session's outbox for upstream replies.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use tether_core::constants::{
    BRIDGE_SHUTDOWN_TIMEOUT, BROWSER_CMD_TIMEOUT, RESULT_BODY_LIMIT, SSE_HEARTBEAT_INTERVAL,
};
use tether_core::now_ms;
use tether_core::protocol::{
    AgentEnvelope, AgentPayload, BrowserExecOutput, BrowserExecRequest, BrowserRegistration,
};
use tether_core::{Error, Result};

use crate::cancel::CancelToken;
use crate::exec::truncate;
use crate::transport::Outbox;

/// Queue depth of events pushed to the extension connection.
const SSE_QUEUE_CAPACITY: usize = 16;

/// The one live extension connection.
struct SseClient {
    id: u64,
    tx: mpsc::Sender<Event>,
    cancel: CancelToken,
}

struct BridgeInner {
    browser_id: String,
    description: String,
    /// Single-client holder; accepting a new connection tears the previous
    /// one down.
    client: Mutex<Option<SseClient>>,
    /// request id → single-shot result channel.
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
    /// Link to the current session for upstream replies; None between
    /// attempts.
    outbox: Mutex<Option<Outbox>>,
    conn_seq: AtomicU64,
}

impl BridgeInner {
    /// Clear the holder and signal offline, but only if `id` is still the
    /// current connection; a replaced connection must not shadow its
    /// replacement's registration.
    async fn detach(&self, id: u64) {
        let was_current = {
            let mut client = self.client.lock().expect("bridge lock poisoned");
            match client.as_ref() {
                Some(current) if current.id == id => {
                    *client = None;
                    true
                }
                _ => false,
            }
        };
        if was_current {
            info!("[浏览器] 插件已断开");
            self.send_registration(false).await;
        }
    }

    async fn send_registration(&self, online: bool) {
        let outbox = self
            .outbox
            .lock()
            .expect("bridge lock poisoned")
            .clone();
        let Some(outbox) = outbox else { return };
        let envelope =
            AgentEnvelope::unsolicited(AgentPayload::BrowserRegistration(BrowserRegistration {
                browser_id: self.browser_id.clone(),
                description: self.description.clone(),
                online,
            }));
        if outbox.send(envelope).await.is_err() {
            warn!("[浏览器] 发送 BrowserRegistration 失败");
        }
    }

    async fn send_exec_output(&self, request_id: &str, result_json: &str, error: &str) {
        let outbox = self
            .outbox
            .lock()
            .expect("bridge lock poisoned")
            .clone();
        let Some(outbox) = outbox else {
            warn!("[浏览器] 无活动会话，丢弃结果: {request_id}");
            return;
        };
        let envelope = AgentEnvelope::reply(
            request_id,
            AgentPayload::BrowserExecOutput(BrowserExecOutput {
                result_json: result_json.to_string(),
                error: error.to_string(),
                done: true,
            }),
        );
        if outbox.send(envelope).await.is_err() {
            warn!("[浏览器] 发送 BrowserExecOutput 失败");
        }
    }
}

/// Supervisor-owned bridge between the Hub and the browser extension.
pub struct BrowserBridge {
    port: u16,
    inner: Arc<BridgeInner>,
    server_cancel: CancelToken,
    server_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<std::net::SocketAddr>>,
}

impl BrowserBridge {
    pub fn new(browser_id: impl Into<String>, description: impl Into<String>, port: u16) -> Self {
        let browser_id = browser_id.into();
        let mut description = description.into();
        if description.is_empty() {
            description = browser_id.clone();
        }
        Self {
            port,
            inner: Arc::new(BridgeInner {
                browser_id,
                description,
                client: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                outbox: Mutex::new(None),
                conn_seq: AtomicU64::new(0),
            }),
            server_cancel: CancelToken::new(),
            server_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bridge's HTTP routes with permissive CORS.
    pub fn router(&self) -> Router {
        let cors = tower_http::cors::CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);
        Router::new()
            .route("/sse", get(handle_sse))
            .route("/result", post(handle_result))
            .route("/status", get(handle_status))
            .layer(DefaultBodyLimit::max(RESULT_BODY_LIMIT))
            .layer(cors)
            .with_state(self.inner.clone())
    }

    /// Bind the local port and serve in the background.
    pub async fn start(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| Error::transport(format!("监听端口 {} 失败: {e}", self.port)))?;
        if let Ok(addr) = listener.local_addr() {
            *self.local_addr.lock().expect("bridge lock poisoned") = Some(addr);
        }
        let app = self.router();
        let shutdown = self.server_cancel.clone();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned());
            if let Err(e) = serve.await {
                warn!("[浏览器] HTTP 服务错误: {e}");
            }
        });
        *self.server_task.lock().expect("bridge lock poisoned") = Some(handle);
        Ok(())
    }

    /// Tear down: kick the extension, close all pending result channels so
    /// waiters observe cancellation, then shut the server down gracefully.
    pub async fn stop(&self) {
        let client = self.inner.client.lock().expect("bridge lock poisoned").take();
        if let Some(client) = client {
            client.cancel.cancel();
        }
        self.inner.pending.lock().expect("bridge lock poisoned").clear();

        self.server_cancel.cancel();
        let handle = self.server_task.lock().expect("bridge lock poisoned").take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(BRIDGE_SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("[浏览器] HTTP 服务关闭超时");
                handle.abort();
            }
        }
    }

    /// Point upstream replies at the current session, or detach with `None`.
    pub fn set_outbox(&self, outbox: Option<Outbox>) {
        *self.inner.outbox.lock().expect("bridge lock poisoned") = outbox;
    }

    /// Bound address once started; reflects the OS-assigned port when the
    /// configured port was 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        *self.local_addr.lock().expect("bridge lock poisoned")
    }

    /// Whether an extension is currently connected.
    pub fn extension_connected(&self) -> bool {
        self.inner
            .client
            .lock()
            .expect("bridge lock poisoned")
            .is_some()
    }

    /// Forward a Hub command to the extension and wait for its result.
    pub async fn handle_browser_exec(&self, request_id: String, req: BrowserExecRequest) {
        let inner = &self.inner;
        info!("[浏览器] 收到命令: {}", truncate(&req.command_json, 80));

        let client_tx = inner
            .client
            .lock()
            .expect("bridge lock poisoned")
            .as_ref()
            .map(|c| c.tx.clone());
        let Some(client_tx) = client_tx else {
            inner
                .send_exec_output(&request_id, "", "浏览器插件未连接")
                .await;
            return;
        };

        let (result_tx, result_rx) = oneshot::channel();
        inner
            .pending
            .lock()
            .expect("bridge lock poisoned")
            .insert(request_id.clone(), result_tx);

        // The command JSON already carries the extension-facing id; forward
        // it untouched.
        let event = Event::default().event("command").data(&req.command_json);
        if client_tx.send(event).await.is_err() {
            inner
                .pending
                .lock()
                .expect("bridge lock poisoned")
                .remove(&request_id);
            inner
                .send_exec_output(&request_id, "", "SSE 推送失败: 连接已断开")
                .await;
            return;
        }

        let timeout = if req.timeout_ms > 0 {
            Duration::from_millis(req.timeout_ms as u64)
        } else {
            BROWSER_CMD_TIMEOUT
        };

        let (result_json, error) = match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(body)) => (body, String::new()),
            Ok(Err(_)) => (String::new(), "请求被取消".to_string()),
            Err(_) => (String::new(), format!("命令执行超时 ({timeout:?})")),
        };

        inner
            .pending
            .lock()
            .expect("bridge lock poisoned")
            .remove(&request_id);
        inner
            .send_exec_output(&request_id, &result_json, &error)
            .await;
    }
}

/// `GET /sse` — attach the extension, replacing any previous connection.
async fn handle_sse(
    State(inner): State<Arc<BridgeInner>>,
) -> Sse<impl futures_util::Stream<Item = std::result::Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(SSE_QUEUE_CAPACITY);
    let token = CancelToken::new();
    let id = inner.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;

    let previous = inner
        .client
        .lock()
        .expect("bridge lock poisoned")
        .replace(SseClient {
            id,
            tx: tx.clone(),
            cancel: token.clone(),
        });
    if let Some(previous) = previous {
        previous.cancel.cancel();
    }

    info!("[浏览器] 插件已连接 (SSE)");
    inner.send_registration(true).await;

    tokio::spawn(connection_task(inner.clone(), id, tx, token.clone()));

    let stream = ReceiverStream::new(rx)
        .map(Ok::<_, Infallible>)
        .take_until(token.cancelled_owned());
    Sse::new(stream)
}

/// Emit the `connected` event and 15 s heartbeats until the connection is
/// replaced, cancelled, or the client goes away.
async fn connection_task(
    inner: Arc<BridgeInner>,
    id: u64,
    tx: mpsc::Sender<Event>,
    cancel: CancelToken,
) {
    let connected = Event::default()
        .event("connected")
        .data(format!("{{\"time\":{}}}", now_ms()));
    if tx.send(connected).await.is_err() {
        inner.detach(id).await;
        return;
    }

    let mut ticker = tokio::time::interval(SSE_HEARTBEAT_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let heartbeat = Event::default()
                    .event("heartbeat")
                    .data(format!("{{\"time\":{}}}", now_ms()));
                if tx.send(heartbeat).await.is_err() {
                    break;
                }
            }
        }
    }
    inner.detach(id).await;
}

#[derive(Deserialize)]
struct ResultBody {
    #[serde(default)]
    id: String,
}

/// `POST /result` — match the extension's result to its waiting request.
async fn handle_result(
    State(inner): State<Arc<BridgeInner>>,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let text = match String::from_utf8(body.to_vec()) {
        Ok(text) => text,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "invalid result: not utf-8").into_response();
        }
    };
    let parsed: ResultBody = match serde_json::from_str(&text) {
        Ok(parsed) => parsed,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, "invalid result: missing id").into_response();
        }
    };
    if parsed.id.is_empty() {
        return (StatusCode::BAD_REQUEST, "invalid result: missing id").into_response();
    }

    let sender = inner
        .pending
        .lock()
        .expect("bridge lock poisoned")
        .remove(&parsed.id);
    match sender {
        Some(tx) => {
            // Raw body, not a re-serialization; the Hub sees what the
            // extension sent.
            let _ = tx.send(text);
        }
        None => warn!("[浏览器] 收到未知 id 的结果: {}", parsed.id),
    }

    Json(json!({"ok": true})).into_response()
}

/// `GET /status` — bridge health for local debugging.
async fn handle_status(State(inner): State<Arc<BridgeInner>>) -> Json<serde_json::Value> {
    let connected = inner
        .client
        .lock()
        .expect("bridge lock poisoned")
        .is_some();
    let pending = inner.pending.lock().expect("bridge lock poisoned").len();
    Json(json!({
        "running": true,
        "extensionConnected": connected,
        "browserID": inner.browser_id,
        "pendingRequests": pending,
    }))
}
