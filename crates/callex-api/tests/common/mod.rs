//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use callex_api::routes;
use callex_api::state::AppState;
use callex_event_store::PgLedgerStore;
use callex_ledger::LedgerConfig;
use callex_test_support::FixedClock;
use http_body_util::BodyExt;
use sqlx::PgPool;
use tower::ServiceExt;

/// Build the full app router over a real `PgLedgerStore` and a fixed clock.
/// Uses the same route structure as `main.rs`.
pub fn build_test_app(pool: PgPool) -> Router {
    let state = AppState::new(
        Arc::new(PgLedgerStore::new(pool)),
        Arc::new(FixedClock::default()),
        LedgerConfig::default(),
    );
    routes::app(state)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body_bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap()
    };

    (status, json)
}

/// Send a request with a JSON body and return the response.
pub async fn send_json(
    app: Router,
    method: &str,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    send(app, request).await
}

/// Send a POST request with a JSON body and return the response.
pub async fn post_json(
    app: Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    send_json(app, "POST", uri, body).await
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// A minimal valid store request.
pub fn event_body(event_type: &str, actor_id: &str, target_id: &str) -> serde_json::Value {
    serde_json::json!({
        "event_type": event_type,
        "actor_id": actor_id,
        "target_id": target_id,
        "action": event_type,
        "compliance_flags": { "tcpa_relevant": true }
    })
}
