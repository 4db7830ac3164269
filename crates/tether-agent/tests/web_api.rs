//! Management panel API surface.

use std::sync::Arc;

use tower::ServiceExt;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};

use tether_agent::supervisor::Supervisor;
use tether_agent::web;
use tether_core::config::{Config, Store};
use tether_core::LogBuffer;

fn test_router(store: Arc<Store>) -> (axum::Router, Supervisor, Arc<LogBuffer>) {
    let supervisor = Supervisor::new(store.clone());
    let logs = Arc::new(LogBuffer::new(16));
    let router = web::router(store, supervisor.clone(), logs.clone());
    (router, supervisor, logs)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_reports_unconfigured_store() {
    let store = Arc::new(Store::in_memory(Config::default()));
    let (router, _supervisor, _logs) = test_router(store);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["configured"], false);
    assert_eq!(json["session"]["state"], "stopped");
    assert_eq!(json["config_path"], serde_json::Value::Null);
}

#[tokio::test]
async fn config_update_persists_and_applies_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    let store = Arc::new(Store::open(path.clone()).unwrap());
    let (router, supervisor, _logs) = test_router(store.clone());

    let body = serde_json::json!({
        "agent": {"address": "ws://h:1", "token": "t"},
        "computer": {"id": "pc", "description": "", "allowed_paths": ["/tmp"]},
        "browser": {"id": "", "description": "", "port": 0},
        "web": {"port": 0}
    });
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::PUT)
                .uri("/api/config")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ok"], true);

    // Persisted with defaults applied
    let reloaded = tether_core::config::load(&path).unwrap();
    assert_eq!(reloaded.agent.address, "ws://h:1");
    assert_eq!(reloaded.browser.port, 19824);
    assert_eq!(reloaded.web.port, 19800);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/config")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["computer"]["id"], "pc");

    supervisor.stop().await;
}

#[tokio::test]
async fn logs_dump_returns_buffered_entries() {
    let store = Arc::new(Store::in_memory(Config::default()));
    let (router, _supervisor, logs) = test_router(store);

    logs.push(tether_core::LogEntry {
        time: chrono::Utc::now(),
        level: tether_core::LogLevel::Info,
        module: "系统".into(),
        message: "第一条".into(),
    });

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/logs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["module"], "系统");
    assert_eq!(json[0]["message"], "第一条");
    assert_eq!(json[0]["level"], "INFO");
}
