//! Direct keyword search with image extraction.

use super::images::normalize_images;
use super::{rank_results, BackendKind, BackendOutput, SearchBackend, SearchError};
use crate::models::{SearchQuery, SearchResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const BACKEND: &str = "tavily";
const MAX_RESULTS: usize = 15;
const IMAGE_ONLY_MAX_RESULTS: usize = 5;

pub struct TavilyBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
    #[serde(default)]
    images: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

impl TavilyBackend {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    async fn call(&self, body: Value, api_key: &str) -> Result<TavilyResponse, SearchError> {
        let request = self
            .client
            .post(format!("{}/search", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.timeout, async {
            let response = request.await.map_err(upstream)?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(SearchError::Upstream {
                    backend: BACKEND,
                    message: format!("HTTP {}: {}", status, text),
                });
            }
            response.json::<TavilyResponse>().await.map_err(upstream)
        })
        .await
        .map_err(|_| SearchError::Timeout(BACKEND))??;

        Ok(response)
    }
}

fn upstream(err: reqwest::Error) -> SearchError {
    SearchError::Upstream {
        backend: BACKEND,
        message: err.to_string(),
    }
}

#[async_trait]
impl SearchBackend for TavilyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tavily
    }

    async fn search(&self, query: &SearchQuery, api_key: &str) -> Result<BackendOutput, SearchError> {
        let body = serde_json::json!({
            "query": query.raw,
            "search_depth": "advanced",
            "max_results": MAX_RESULTS,
            "include_images": true,
        });

        let response = self.call(body, api_key).await?;
        let results = response
            .results
            .into_iter()
            .map(|r| SearchResult {
                rank: 0,
                title: r.title,
                url: r.url,
                excerpt: r.content,
            })
            .collect();

        Ok(BackendOutput {
            results: rank_results(results, MAX_RESULTS),
            images: normalize_images(&response.images),
        })
    }

    async fn images(&self, query: &str, api_key: &str) -> Result<Vec<String>, SearchError> {
        let body = serde_json::json!({
            "query": query,
            "search_depth": "basic",
            "max_results": IMAGE_ONLY_MAX_RESULTS,
            "include_images": true,
        });

        let response = self.call(body, api_key).await?;
        Ok(normalize_images(&response.images))
    }
}
