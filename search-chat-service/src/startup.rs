//! Application startup and lifecycle management.

use crate::config::ChatConfig;
use crate::handlers;
use crate::services::providers::gemini::{GeminiConfig, GeminiEngine};
use crate::services::providers::GenerationEngine;
use crate::services::stores::{InMemoryCreditStore, InMemoryGuestQuotaStore, InMemoryPreferenceStore};
use crate::services::{ChatDb, ChatPipeline, Collaborators};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::{
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{create_ip_rate_limiter, ip_rate_limit_middleware, request_id_middleware};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ChatConfig>,
    pub pipeline: Arc<ChatPipeline>,
    /// `None` when the service runs on in-memory stores.
    pub db: Option<ChatDb>,
}

/// HTTP routes with request ids, tracing, CORS and the per-IP limit on chat.
pub fn router(state: AppState) -> Router {
    let limiter = create_ip_rate_limiter(state.config.rate_limit.requests_per_minute, 60);

    let chat = Router::new()
        .route("/api/chat", post(handlers::chat::chat))
        .layer(from_fn_with_state(limiter, ip_rate_limit_middleware));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics))
        .merge(chat)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build with the production collaborators: Gemini and, when configured,
    /// MongoDB-backed stores.
    pub async fn build(config: ChatConfig) -> Result<Self, AppError> {
        let config = Arc::new(config);
        let engine: Arc<dyn GenerationEngine> = Arc::new(GeminiEngine::new(GeminiConfig {
            api_key: config.engine.api_key.clone(),
            base_url: config.engine.base_url.clone(),
        }));

        let (deps, db) = match &config.mongodb {
            Some(mongo) => {
                let db = ChatDb::connect(&mongo.uri, &mongo.database).await?;
                db.initialize_indexes().await?;
                let shared = Arc::new(db.clone());
                let deps = Collaborators {
                    engine,
                    credits: shared.clone(),
                    preferences: shared.clone(),
                    guest_quota: shared,
                };
                (deps, Some(db))
            }
            None if config.common.is_production() => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "MONGODB_URI is required in production but not set"
                )));
            }
            None => {
                tracing::warn!("MONGODB_URI not set, credits and guest quota are kept in memory");
                let deps = Collaborators {
                    engine,
                    credits: Arc::new(InMemoryCreditStore::new()),
                    preferences: Arc::new(InMemoryPreferenceStore::new()),
                    guest_quota: Arc::new(InMemoryGuestQuotaStore::new()),
                };
                (deps, None)
            }
        };

        Self::build_with(config, deps, db).await
    }

    /// Build around explicit collaborators. Port 0 binds a random port.
    pub async fn build_with(
        config: Arc<ChatConfig>,
        deps: Collaborators,
        db: Option<ChatDb>,
    ) -> Result<Self, AppError> {
        let engine = deps.engine.name();
        let pipeline = Arc::new(ChatPipeline::from_config(config.clone(), deps)?);
        let state = AppState {
            config: config.clone(),
            pipeline,
            db,
        };

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            port,
            engine,
            default_backend = config.search.default_backend.as_str(),
            models = config.models.len(),
            "Search chat service ready"
        );

        Ok(Self {
            port,
            listener,
            router: router(state),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves, then let in-flight streams drain.
    pub async fn run_with_shutdown<F>(self, signal: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
    }
}
