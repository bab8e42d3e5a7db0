//! Shared helpers: a fixture server standing in for the search and weather
//! providers, and a service instance wired to it with in-memory stores.

#![allow(dead_code)]

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use search_chat_service::config::ChatConfig;
use search_chat_service::services::providers::mock::ScriptedEngine;
use search_chat_service::services::search::BackendKind;
use search_chat_service::services::stores::{
    CreditStore, InMemoryCreditStore, InMemoryGuestQuotaStore, InMemoryPreferenceStore,
};
use search_chat_service::services::Collaborators;
use search_chat_service::startup::Application;
use serde_json::{json, Value};
use service_core::config::Config as CoreConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub const WIKIPEDIA_PARIS: &str = "https://en.wikipedia.org/wiki/Paris";
pub const BRITANNICA_PARIS: &str = "https://www.britannica.com/place/Paris";
pub const PARIS_IMAGE: &str = "https://images.example.com/paris.jpg";
pub const EIFFEL_IMAGE: &str = "https://images.example.com/eiffel.jpg";

/// Calls received by the fixture server.
#[derive(Default)]
pub struct Hits {
    pub tavily: AtomicUsize,
    pub parallel: AtomicUsize,
    pub geocoding: AtomicUsize,
    pub forecast: AtomicUsize,
    pub tavily_bodies: Mutex<Vec<Value>>,
    pub tavily_keys: Mutex<Vec<String>>,
}

impl Hits {
    pub fn tavily(&self) -> usize {
        self.tavily.load(Ordering::SeqCst)
    }

    pub fn parallel(&self) -> usize {
        self.parallel.load(Ordering::SeqCst)
    }

    pub fn geocoding(&self) -> usize {
        self.geocoding.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.tavily() + self.parallel() + self.geocoding() + self.forecast.load(Ordering::SeqCst)
    }
}

async fn tavily(
    State(hits): State<Arc<Hits>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    hits.tavily.fetch_add(1, Ordering::SeqCst);
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        hits.tavily_keys.lock().unwrap().push(auth.to_string());
    }
    hits.tavily_bodies.lock().unwrap().push(body);

    Json(json!({
        "results": [
            {"title": "Paris - Wikipedia", "url": WIKIPEDIA_PARIS, "content": "Paris is the capital and largest city of France.", "score": 0.98},
            {"title": "Paris | History, Map, Population", "url": BRITANNICA_PARIS, "content": "Paris, city and capital of France.", "score": 0.91},
            {"title": "Broken", "url": "not-a-url", "content": "dropped"}
        ],
        "images": [
            PARIS_IMAGE,
            {"url": EIFFEL_IMAGE, "description": "Eiffel Tower"},
            PARIS_IMAGE
        ]
    }))
}

async fn parallel(State(hits): State<Arc<Hits>>, Json(_body): Json<Value>) -> Json<Value> {
    hits.parallel.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "search_id": "search_1",
        "results": [
            {"url": WIKIPEDIA_PARIS, "title": "Paris - Wikipedia", "excerpts": ["Paris is the capital of France.", "Population 2.1 million."]}
        ]
    }))
}

async fn geocoding(
    State(hits): State<Arc<Hits>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    hits.geocoding.fetch_add(1, Ordering::SeqCst);
    let name = params.get("name").cloned().unwrap_or_default();
    Json(json!({
        "results": [{"name": name, "latitude": 48.85, "longitude": 2.35, "country": "France"}]
    }))
}

async fn forecast(State(hits): State<Arc<Hits>>) -> Json<Value> {
    hits.forecast.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "current": {
            "temperature_2m": 18.5,
            "apparent_temperature": 17.9,
            "relative_humidity_2m": 60.0,
            "wind_speed_10m": 11.2,
            "weather_code": 2
        }
    }))
}

pub struct Fixtures {
    pub base_url: String,
    pub hits: Arc<Hits>,
}

pub async fn spawn_fixtures() -> Fixtures {
    let hits = Arc::new(Hits::default());
    let app = Router::new()
        .route("/search", post(tavily))
        .route("/v1beta/search", post(parallel))
        .route("/v1/search", get(geocoding))
        .route("/v1/forecast", get(forecast))
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Fixtures {
        base_url: format!("http://{}", addr),
        hits,
    }
}

pub struct TestApp {
    pub address: String,
    pub hits: Arc<Hits>,
    pub engine: Arc<ScriptedEngine>,
    pub preferences: Arc<InMemoryPreferenceStore>,
    client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn(engine: ScriptedEngine, credits: InMemoryCreditStore) -> Self {
        Self::spawn_with(engine, Arc::new(credits), |_| {}).await
    }

    pub async fn spawn_with(
        engine: ScriptedEngine,
        credits: Arc<dyn CreditStore>,
        configure: impl FnOnce(&mut ChatConfig),
    ) -> Self {
        let fixtures = spawn_fixtures().await;

        let mut config = ChatConfig::with_defaults(CoreConfig {
            port: 0,
            ..CoreConfig::default()
        });
        config.search.tavily_base_url = fixtures.base_url.clone();
        config.search.parallel_base_url = fixtures.base_url.clone();
        config.search.tavily_api_key = Some("tvly-service".to_string());
        config.search.parallel_api_key = Some("par-service".to_string());
        config.search.default_backend = BackendKind::Tavily;
        config.tools.geocoding_base_url = fixtures.base_url.clone();
        config.tools.forecast_base_url = fixtures.base_url.clone();
        configure(&mut config);

        let engine = Arc::new(engine);
        let preferences = Arc::new(InMemoryPreferenceStore::new());
        let deps = Collaborators {
            engine: engine.clone(),
            credits,
            preferences: preferences.clone(),
            guest_quota: Arc::new(InMemoryGuestQuotaStore::new()),
        };

        let app = Application::build_with(Arc::new(config), deps, None)
            .await
            .expect("Failed to build application");
        let address = format!("http://127.0.0.1:{}", app.port());
        tokio::spawn(async move {
            let _ = app.run_until_stopped().await;
        });

        Self {
            address,
            hits: fixtures.hits,
            engine,
            preferences,
            client: reqwest::Client::new(),
        }
    }

    /// POST a chat body, authenticated as `user` when given.
    pub async fn post_chat(&self, body: &Value, user: Option<&str>) -> reqwest::Response {
        let mut request = self
            .client
            .post(format!("{}/api/chat", self.address))
            .json(body);
        if let Some(user) = user {
            request = request.header("x-user-id", user);
        }
        request.send().await.expect("Failed to execute request")
    }

    /// Guest chat that claims its own anonymous id.
    pub async fn post_guest_chat(&self, body: &Value, anonymous_id: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/api/chat", self.address))
            .header("x-anonymous-id", anonymous_id)
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.address, path))
            .send()
            .await
            .expect("Failed to execute request")
    }
}

pub fn chat_body(content: &str, model: &str, web_search: bool) -> Value {
    json!({
        "messages": [{"role": "user", "content": content}],
        "model": model,
        "conversationStyle": "Balanced",
        "webSearch": web_search
    })
}
