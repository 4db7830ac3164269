//! Management panel HTTP API.
//!
//! Exposes supervisor status, the persisted configuration, and the log
//! buffer (dump + live SSE stream). A config update persists first, then
//! restarts the supervisor so the new settings take effect; the session is
//! never mutated in place.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use tether_core::config::{Config, Store};
use tether_core::constants::{CONFIG_BODY_LIMIT, WEB_SHUTDOWN_TIMEOUT};
use tether_core::{Error, LogBuffer, LogEntry, Result};

use crate::cancel::CancelToken;
use crate::supervisor::Supervisor;

#[derive(Clone)]
struct WebState {
    store: Arc<Store>,
    supervisor: Supervisor,
    logs: Arc<LogBuffer>,
}

/// The panel's routes with permissive CORS.
pub fn router(store: Arc<Store>, supervisor: Supervisor, logs: Arc<LogBuffer>) -> Router {
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/logs", get(get_logs))
        .route("/api/logs/stream", get(stream_logs))
        .layer(DefaultBodyLimit::max(CONFIG_BODY_LIMIT))
        .layer(cors)
        .with_state(WebState {
            store,
            supervisor,
            logs,
        })
}

/// Serve the panel until cancelled; connections get a bounded grace period.
pub async fn serve(
    port: u16,
    store: Arc<Store>,
    supervisor: Supervisor,
    logs: Arc<LogBuffer>,
    cancel: CancelToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::transport(format!("监听端口 {port} 失败: {e}")))?;
    info!("[Web] 管理面板: http://localhost:{port}");

    let app = router(store, supervisor, logs);
    let shutdown = cancel.clone();
    let mut server = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned());
        if let Err(e) = serve.await {
            warn!("[Web] 服务异常: {e}");
        }
    });

    cancel.cancelled().await;
    // Live SSE log streams keep connections open; don't wait on them
    // forever.
    if tokio::time::timeout(WEB_SHUTDOWN_TIMEOUT, &mut server)
        .await
        .is_err()
    {
        server.abort();
    }
    Ok(())
}

async fn get_status(State(state): State<WebState>) -> Json<serde_json::Value> {
    let cfg = state.store.get();
    Json(json!({
        "session": state.supervisor.status(),
        "configured": cfg.is_configured(),
        "config_path": state.store.path().map(|p| p.display().to_string()),
    }))
}

async fn get_config(State(state): State<WebState>) -> Json<Config> {
    Json(state.store.get())
}

async fn put_config(
    State(state): State<WebState>,
    Json(mut cfg): Json<Config>,
) -> axum::response::Response {
    cfg.apply_defaults();
    if let Err(e) = state.store.update(cfg) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
            .into_response();
    }
    info!("[管理] 配置已更新，重启连接");
    state.supervisor.restart().await;
    Json(json!({"ok": true})).into_response()
}

async fn get_logs(State(state): State<WebState>) -> Json<Vec<LogEntry>> {
    Json(state.logs.all())
}

async fn stream_logs(
    State(state): State<WebState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (id, rx) = state.logs.subscribe();
    let stream = LogStream {
        buffer: state.logs.clone(),
        id,
        rx,
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Live log stream that unsubscribes when the client goes away.
struct LogStream {
    buffer: Arc<LogBuffer>,
    id: u64,
    rx: mpsc::Receiver<LogEntry>,
}

impl Stream for LogStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|entry| {
            entry.map(|entry| {
                let data = serde_json::to_string(&entry).unwrap_or_default();
                Ok(Event::default().data(data))
            })
        })
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.buffer.unsubscribe(self.id);
    }
}
