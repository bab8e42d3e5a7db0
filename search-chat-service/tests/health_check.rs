mod common;

use common::TestApp;
use search_chat_service::services::init_metrics;
use search_chat_service::services::providers::mock::ScriptedEngine;
use search_chat_service::services::stores::InMemoryCreditStore;

#[tokio::test]
async fn health_check_reports_memory_store() {
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;

    let response = app.get("/health").await;
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "search-chat-service");
    assert_eq!(body["store"], "memory");
}

#[tokio::test]
async fn readiness_check_works() {
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;

    let response = app.get("/ready").await;
    assert!(response.status().is_success());
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;

    let response = app.get("/health").await;
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn metrics_endpoint_returns_prometheus_format() {
    init_metrics().expect("metrics register");
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;

    let response = app.get("/metrics").await;
    assert!(response.status().is_success());

    let content_type = response
        .headers()
        .get("content-type")
        .expect("Missing content-type header")
        .to_str()
        .expect("Invalid content-type");
    assert!(content_type.starts_with("text/plain"));

    let body = response.text().await.expect("Failed to get response body");
    assert!(
        body.is_empty() || body.contains('#') || body.contains('_'),
        "Unexpected metrics format: {}",
        body
    );
}
