#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use mcphub::mcp::InMemoryToolSearch;
use mcphub::reconnect::ReconnectLimits;
use mcphub::routes::create_router;
use mcphub::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

async fn started_app() -> (AppState, Router) {
    let state = AppState::new(
        store(standard_settings()),
        standard_factory(),
        Arc::new(InMemoryToolSearch::new()),
        fast_settings(),
        ReconnectLimits::default(),
    );
    state.start().await;
    assert!(state.manager.wait_until_settled(Duration::from_secs(5)).await);
    let app = create_router(state.clone());
    (state, app)
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(body) => Body::from(body.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn tools_list(id: i64) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"})
}

fn names(response: &Value) -> Vec<String> {
    let mut names: Vec<String> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str().map(str::to_string))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_mcp_endpoint_scopes() {
    let (_state, app) = started_app().await;

    let (status, all) = send(&app, "POST", "/mcp", Some(tools_list(1))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(names(&all).len(), 5);

    let (_, group) = send(&app, "POST", "/mcp/g1", Some(tools_list(2))).await;
    assert_eq!(names(&group), vec!["weather-alerts", "weather-forecast"]);

    let (_, backend) = send(&app, "POST", "/mcp/fetch", Some(tools_list(3))).await;
    assert_eq!(names(&backend), vec!["fetch-fetch"]);

    let (_, smart) = send(&app, "POST", "/mcp/$smart", Some(tools_list(4))).await;
    assert_eq!(names(&smart), vec!["call_tool", "search_tools"]);

    let (status, missing) = send(&app, "POST", "/mcp/nowhere", Some(tools_list(5))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(missing["error"]["code"], "UNKNOWN_SCOPE");
}

#[tokio::test]
async fn test_mcp_endpoint_rejects_bad_json_and_accepts_notifications() {
    let (_state, app) = started_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], -32700);

    let (status, _) = send(
        &app,
        "POST",
        "/mcp",
        Some(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_health_reports_backends() {
    let (_state, app) = started_app().await;

    let (status, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["connectedBackends"], 3);
    assert_eq!(health["localSessions"], 0);

    let (status, _) = send(&app, "GET", "/health/live", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_reload_applies_store_changes() {
    let (state, app) = started_app().await;

    state.store.set_backend_enabled("units", false).unwrap();
    let (status, outcome) = send(&app, "POST", "/admin/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["removed"], json!([]));

    let (_, all) = send(&app, "POST", "/mcp", Some(tools_list(1))).await;
    assert!(names(&all).iter().all(|n| !n.starts_with("units-")));

    // a disabled backend does not count against health
    let (_, health) = send(&app, "GET", "/health", None).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["connectedBackends"], 2);

    let (status, error) = send(&app, "POST", "/admin/endpoints/missing/reconnect", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"]["code"], "BAD_REQUEST");

    state.shutdown().await;
}
