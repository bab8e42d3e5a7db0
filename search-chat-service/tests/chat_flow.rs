mod common;

use async_trait::async_trait;
use common::{
    chat_body, TestApp, BRITANNICA_PARIS, EIFFEL_IMAGE, PARIS_IMAGE, WIKIPEDIA_PARIS,
};
use search_chat_service::error::{GUEST_WEB_SEARCH_RESTRICTED_MESSAGE, INSUFFICIENT_CREDITS_MESSAGE};
use search_chat_service::models::{CreditAccount, CreditBalances, Tier};
use search_chat_service::services::markers::{decode_transcript, SEARCH_IMAGES, SEARCH_URLS};
use search_chat_service::services::providers::mock::{complete, ScriptedEngine};
use search_chat_service::services::providers::{EngineEvent, FinishReason, ToolInvocation, Turn};
use search_chat_service::services::search::BackendKind;
use search_chat_service::services::stores::{
    ConsumeOutcome, CreditStore, DebitRequest, InMemoryCreditStore, SearchPreferences, StoreError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const FREE_MODEL: &str = "gemini-2.0-flash";
const PREMIUM_MODEL: &str = "gemini-2.5-flash";

fn tool_call(name: &str, args: Value) -> EngineEvent {
    EngineEvent::ToolCall(ToolInvocation {
        name: name.to_string(),
        args,
    })
}

fn free_user(id: &str) -> CreditAccount {
    CreditAccount::new(id, Tier::Free)
}

#[tokio::test]
async fn guest_web_search_is_refused_before_any_work() {
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;

    let mut body = chat_body("capital of France", FREE_MODEL, true);
    body["isGuest"] = json!(true);
    let response = app.post_chat(&body, None).await;

    assert_eq!(response.status().as_u16(), 403);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], "GUEST_WEB_SEARCH_RESTRICTED");
    assert_eq!(error["error"], GUEST_WEB_SEARCH_RESTRICTED_MESSAGE);
    assert_eq!(app.hits.total(), 0);
    assert!(app.engine.stream_requests().is_empty());
}

#[tokio::test]
async fn insufficient_credits_make_no_external_calls() {
    let credits = InMemoryCreditStore::new().with_account(
        CreditAccount::new("u-broke", Tier::Free).with_balances(CreditBalances {
            free: 10,
            premium: 0,
            super_premium: 0,
        }),
    );
    let app = TestApp::spawn(ScriptedEngine::new(), credits).await;

    let response = app
        .post_chat(&chat_body("capital of France", PREMIUM_MODEL, true), Some("u-broke"))
        .await;

    assert_eq!(response.status().as_u16(), 403);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], "INSUFFICIENT_CREDITS");
    assert_eq!(error["error"], INSUFFICIENT_CREDITS_MESSAGE);
    assert_eq!(app.hits.total(), 0);
    assert!(app.engine.stream_requests().is_empty());
    assert!(app.engine.completion_requests().is_empty());
}

#[tokio::test]
async fn missing_engine_key_is_reported_before_search_or_debit() {
    let credits = Arc::new(InMemoryCreditStore::new().with_account(free_user("u1")));
    let app = TestApp::spawn_with(
        ScriptedEngine::new().without_service_key(),
        credits.clone(),
        |_| {},
    )
    .await;

    let response = app
        .post_chat(&chat_body("capital of France", FREE_MODEL, true), Some("u1"))
        .await;

    assert_eq!(response.status().as_u16(), 401);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], "MISSING_API_KEY");
    assert_eq!(app.hits.total(), 0);
    assert_eq!(credits.transaction_count(), 0);
    assert!(app.engine.stream_requests().is_empty());
}

#[tokio::test]
async fn tavily_search_answer_carries_markers_in_order() {
    let engine = ScriptedEngine::new().with_text_turn(&[
        "Paris is the capital of France ",
        "[1](https://en.wikipedia.org/wiki/Paris).",
    ]);
    let app = TestApp::spawn(engine, InMemoryCreditStore::new().with_account(free_user("u1"))).await;

    let response = app
        .post_chat(&chat_body("capital of France", FREE_MODEL, true), Some("u1"))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let text = response.text().await.unwrap();

    assert!(text.starts_with("<!-- RETRIEVAL_CARD:"));
    let prose_at = text.find("Paris is the capital of France").unwrap();
    let urls_at = text.find(&format!("<!-- {}:", SEARCH_URLS)).unwrap();
    let images_at = text.find(&format!("<!-- {}:", SEARCH_IMAGES)).unwrap();
    assert!(prose_at < urls_at && urls_at < images_at);
    assert!(text.trim_end().ends_with("-->"));

    let decoded = decode_transcript(&text);
    assert_eq!(
        decoded.urls,
        Some(vec![WIKIPEDIA_PARIS.to_string(), BRITANNICA_PARIS.to_string()])
    );
    assert_eq!(
        decoded.images,
        Some(vec![PARIS_IMAGE.to_string(), EIFFEL_IMAGE.to_string()])
    );
    assert_eq!(
        decoded.prose,
        "Paris is the capital of France [1](https://en.wikipedia.org/wiki/Paris)."
    );

    assert_eq!(app.hits.tavily(), 1);
    assert_eq!(app.hits.parallel(), 0);
    let sent = app.hits.tavily_bodies.lock().unwrap()[0].clone();
    assert_eq!(sent["query"], "capital of France");
    assert_eq!(sent["search_depth"], "advanced");
    assert_eq!(app.hits.tavily_keys.lock().unwrap()[0], "Bearer tvly-service");

    let instruction = app.engine.stream_requests()[0]
        .system_instruction
        .clone()
        .unwrap();
    assert!(instruction.contains(WIKIPEDIA_PARIS));
    assert!(instruction.contains(BRITANNICA_PARIS));
}

#[tokio::test]
async fn parallel_preference_expands_query_and_borrows_tavily_images() {
    let engine = ScriptedEngine::new()
        .with_completion("1. paris population\n2. paris landmarks")
        .with_text_turn(&["Paris has about two million residents."]);
    let app = TestApp::spawn(engine, InMemoryCreditStore::new().with_account(free_user("u1"))).await;
    app.preferences.set(
        "u1",
        SearchPreferences {
            backend: Some(BackendKind::Parallel),
            ..Default::default()
        },
    );

    let response = app
        .post_chat(&chat_body("tell me about Paris", FREE_MODEL, true), Some("u1"))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let decoded = decode_transcript(&response.text().await.unwrap());

    assert_eq!(app.hits.parallel(), 1);
    assert_eq!(app.hits.tavily(), 1);
    let image_lookup = app.hits.tavily_bodies.lock().unwrap()[0].clone();
    assert_eq!(image_lookup["query"], "tell me about Paris");
    assert_eq!(image_lookup["search_depth"], "basic");

    assert_eq!(decoded.urls, Some(vec![WIKIPEDIA_PARIS.to_string()]));
    assert_eq!(
        decoded.images,
        Some(vec![PARIS_IMAGE.to_string(), EIFFEL_IMAGE.to_string()])
    );
    assert_eq!(app.engine.completion_requests().len(), 1);
}

/// Credit store whose debits land well after the configured wait.
struct SlowCredits {
    inner: InMemoryCreditStore,
    delay: Duration,
}

#[async_trait]
impl CreditStore for SlowCredits {
    async fn account(&self, user_id: &str) -> Result<CreditAccount, StoreError> {
        self.inner.account(user_id).await
    }

    async fn consume(&self, debit: &DebitRequest) -> Result<ConsumeOutcome, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.consume(debit).await
    }
}

#[tokio::test]
async fn slow_debit_does_not_block_the_answer() {
    let credits = Arc::new(SlowCredits {
        inner: InMemoryCreditStore::new().with_account(free_user("u1")),
        delay: Duration::from_millis(600),
    });
    let engine = ScriptedEngine::new().with_text_turn(&["Answer without waiting."]);
    let app = TestApp::spawn_with(engine, credits.clone(), |config| {
        config.credits.debit_timeout = Duration::from_millis(100);
    })
    .await;

    let started = std::time::Instant::now();
    let response = app
        .post_chat(&chat_body("capital of France", FREE_MODEL, true), Some("u1"))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(600));
    assert!(text.contains("Answer without waiting."));

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(credits.inner.transaction_count(), 1);
    assert_eq!(credits.inner.account("u1").await.unwrap().balances.free, 49);
}

#[tokio::test]
async fn in_stream_tools_run_in_order_and_only_tool_search_supplies_images() {
    let engine = ScriptedEngine::new()
        .with_turn(vec![
            tool_call("weather", json!({"location": "Paris"})),
            complete(FinishReason::ToolCall),
        ])
        .with_turn(vec![
            tool_call("search", json!({"query": "Paris weekend events"})),
            complete(FinishReason::ToolCall),
        ])
        .with_text_turn(&["Mild weather, see [1](https://en.wikipedia.org/wiki/Paris)."]);
    let app = TestApp::spawn(engine, InMemoryCreditStore::new().with_account(free_user("u1"))).await;

    let response = app
        .post_chat(
            &chat_body("weather in Paris and what to do", FREE_MODEL, false),
            Some("u1"),
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let decoded = decode_transcript(&response.text().await.unwrap());

    assert_eq!(app.hits.geocoding(), 1);
    assert_eq!(app.hits.tavily(), 1);
    assert_eq!(
        app.hits.tavily_bodies.lock().unwrap()[0]["query"],
        "Paris weekend events"
    );
    assert_eq!(
        decoded.images,
        Some(vec![PARIS_IMAGE.to_string(), EIFFEL_IMAGE.to_string()])
    );
    assert_eq!(
        decoded.urls,
        Some(vec![WIKIPEDIA_PARIS.to_string(), BRITANNICA_PARIS.to_string()])
    );

    let requests = app.engine.stream_requests();
    assert_eq!(requests.len(), 3);
    let calls: Vec<&str> = requests[2]
        .turns
        .iter()
        .filter_map(|turn| match turn {
            Turn::ToolCall { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(calls, vec!["weather", "search"]);

    let weather = requests[2]
        .turns
        .iter()
        .find_map(|turn| match turn {
            Turn::ToolResult { name, result } if name == "weather" => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(weather["temperature"], 18.5);
    assert_eq!(weather["conditions"], "partly cloudy");
}

#[tokio::test]
async fn guest_quota_is_enforced_server_side() {
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;
    let mut body = chat_body("hello", FREE_MODEL, false);
    body["isGuest"] = json!(true);

    for _ in 0..2 {
        let response = app.post_chat(&body, None).await;
        assert_eq!(response.status().as_u16(), 200);
        response.text().await.unwrap();
    }

    let response = app.post_chat(&body, None).await;
    assert_eq!(response.status().as_u16(), 429);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], "GUEST_QUOTA_EXCEEDED");
}

#[tokio::test]
async fn rotating_client_ids_does_not_reset_guest_quota() {
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;
    let mut body = chat_body("hello", FREE_MODEL, false);
    body["isGuest"] = json!(true);

    for device in ["device-1", "device-2"] {
        let response = app.post_guest_chat(&body, device).await;
        assert_eq!(response.status().as_u16(), 200);
        response.text().await.unwrap();
    }

    let response = app.post_guest_chat(&body, "device-3").await;
    assert_eq!(response.status().as_u16(), 429);
}

#[tokio::test]
async fn malformed_body_is_a_validation_error() {
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;

    let response = app
        .post_chat(&json!({"messages": [], "model": FREE_MODEL, "conversationStyle": "Balanced"}), Some("u1"))
        .await;

    assert_eq!(response.status().as_u16(), 400);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let app = TestApp::spawn(ScriptedEngine::new(), InMemoryCreditStore::new()).await;

    let response = app
        .post_chat(&chat_body("hi", "gpt-unknown", false), Some("u1"))
        .await;

    assert_eq!(response.status().as_u16(), 400);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["code"], "UNKNOWN_MODEL");
}
