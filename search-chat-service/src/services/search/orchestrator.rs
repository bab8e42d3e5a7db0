//! Chooses the backend, resolves keys, and merges results with images.

use super::{BackendKind, QueryExpander, SearchBackend, SearchError};
use crate::models::{ImageList, SearchQuery, SearchResult};
use crate::services::metrics;
use std::sync::Arc;
use std::time::Instant;

/// Per-backend API keys.
#[derive(Debug, Clone, Default)]
pub struct SearchKeys {
    pub parallel: Option<String>,
    pub tavily: Option<String>,
}

impl SearchKeys {
    pub fn get(&self, kind: BackendKind) -> Option<&str> {
        match kind {
            BackendKind::Parallel => self.parallel.as_deref(),
            BackendKind::Tavily => self.tavily.as_deref(),
        }
    }
}

/// Backend and keys fixed for the lifetime of one request.
#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub backend: BackendKind,
    primary_key: String,
    /// Key for the image-only lookup when the primary backend has no images.
    image_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub query: SearchQuery,
    pub results: Vec<SearchResult>,
    pub images: ImageList,
}

pub struct SearchOrchestrator {
    parallel: Arc<dyn SearchBackend>,
    tavily: Arc<dyn SearchBackend>,
    expander: QueryExpander,
    service_keys: SearchKeys,
}

fn nonblank(key: Option<&str>) -> Option<String> {
    key.map(str::trim).filter(|k| !k.is_empty()).map(str::to_string)
}

impl SearchOrchestrator {
    pub fn new(
        parallel: Arc<dyn SearchBackend>,
        tavily: Arc<dyn SearchBackend>,
        expander: QueryExpander,
        service_keys: SearchKeys,
    ) -> Self {
        Self {
            parallel,
            tavily,
            expander,
            service_keys,
        }
    }

    fn backend(&self, kind: BackendKind) -> &Arc<dyn SearchBackend> {
        match kind {
            BackendKind::Parallel => &self.parallel,
            BackendKind::Tavily => &self.tavily,
        }
    }

    /// Resolve keys for `backend`. Stored per-user overrides win, then the
    /// service key, then the key the caller sent with the request.
    pub fn plan(
        &self,
        backend: BackendKind,
        overrides: &SearchKeys,
        caller_key: Option<&str>,
    ) -> Result<SearchPlan, SearchError> {
        let primary_key = nonblank(overrides.get(backend))
            .or_else(|| nonblank(self.service_keys.get(backend)))
            .or_else(|| nonblank(caller_key))
            .ok_or(SearchError::MissingKey(backend.as_str()))?;

        let image_key = match backend {
            BackendKind::Tavily => None,
            BackendKind::Parallel => nonblank(overrides.get(BackendKind::Tavily))
                .or_else(|| nonblank(self.service_keys.get(BackendKind::Tavily))),
        };

        Ok(SearchPlan {
            backend,
            primary_key,
            image_key,
        })
    }

    /// Full pre-generation search. The multi-query backend gets expanded
    /// sub-queries, with its images fetched concurrently from the image
    /// source using the raw query.
    pub async fn search(
        &self,
        plan: &SearchPlan,
        raw: &str,
        engine_key: Option<&str>,
    ) -> Result<SearchOutcome, SearchError> {
        let query = match plan.backend {
            BackendKind::Parallel => self.expander.expand(raw, engine_key).await,
            BackendKind::Tavily => SearchQuery::single(raw),
        };
        self.execute(plan, query).await
    }

    /// Single-query search used by the in-stream search tool.
    pub async fn search_single(
        &self,
        plan: &SearchPlan,
        query: &str,
    ) -> Result<SearchOutcome, SearchError> {
        self.execute(plan, SearchQuery::single(query)).await
    }

    async fn execute(&self, plan: &SearchPlan, query: SearchQuery) -> Result<SearchOutcome, SearchError> {
        let started = Instant::now();
        let backend = self.backend(plan.backend);

        let (primary, side_images) = tokio::join!(
            backend.search(&query, &plan.primary_key),
            self.image_lookup(plan, &query.raw)
        );

        let elapsed = started.elapsed();
        let output = match primary {
            Ok(output) => output,
            Err(e) => {
                metrics::record_search_error(plan.backend.as_str());
                tracing::error!(backend = plan.backend.as_str(), error = %e, "Search failed");
                return Err(e);
            }
        };
        metrics::observe_search_latency(plan.backend.as_str(), elapsed.as_secs_f64());

        let mut images: ImageList = output.images.iter().collect();
        images.extend(side_images);

        tracing::info!(
            backend = plan.backend.as_str(),
            sub_queries = query.sub_queries.len(),
            results = output.results.len(),
            images = images.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Search completed"
        );

        Ok(SearchOutcome {
            query,
            results: output.results,
            images,
        })
    }

    async fn image_lookup(&self, plan: &SearchPlan, raw: &str) -> Vec<String> {
        let Some(key) = plan.image_key.as_deref() else {
            return Vec::new();
        };

        match self.tavily.images(raw, key).await {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!(error = %e, "Image lookup failed, continuing without images");
                Vec::new()
            }
        }
    }
}
