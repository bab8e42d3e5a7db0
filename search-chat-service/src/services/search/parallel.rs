//! Objective-driven crawler backend. Takes every sub-query in one call and
//! returns excerpt lists per result. It does not return images.

use super::{rank_results, BackendKind, BackendOutput, SearchBackend, SearchError};
use crate::models::{SearchQuery, SearchResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const BACKEND: &str = "parallel";
const MAX_RESULTS: usize = 10;
const MAX_CHARS_PER_RESULT: usize = 6000;

pub struct ParallelBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ParallelRequest<'a> {
    objective: &'a str,
    search_queries: &'a [String],
    processor: &'static str,
    max_results: usize,
    max_chars_per_result: usize,
}

#[derive(Debug, Deserialize)]
struct ParallelResponse {
    #[serde(default)]
    results: Vec<ParallelResult>,
}

#[derive(Debug, Deserialize)]
struct ParallelResult {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    excerpts: Vec<String>,
}

impl ParallelBackend {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

fn upstream(err: reqwest::Error) -> SearchError {
    SearchError::Upstream {
        backend: BACKEND,
        message: err.to_string(),
    }
}

fn join_excerpts(excerpts: Vec<String>) -> String {
    let joined = excerpts
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    match joined.char_indices().nth(MAX_CHARS_PER_RESULT) {
        Some((cut, _)) => joined[..cut].to_string(),
        None => joined,
    }
}

#[async_trait]
impl SearchBackend for ParallelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallel
    }

    async fn search(&self, query: &SearchQuery, api_key: &str) -> Result<BackendOutput, SearchError> {
        let body = ParallelRequest {
            objective: &query.raw,
            search_queries: &query.sub_queries,
            processor: "base",
            max_results: MAX_RESULTS,
            max_chars_per_result: MAX_CHARS_PER_RESULT,
        };

        let request = self
            .client
            .post(format!("{}/v1beta/search", self.base_url))
            .header("x-api-key", api_key)
            .json(&body)
            .send();

        let parsed = tokio::time::timeout(self.timeout, async {
            let response = request.await.map_err(upstream)?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(SearchError::Upstream {
                    backend: BACKEND,
                    message: format!("HTTP {}: {}", status, text),
                });
            }
            response.json::<ParallelResponse>().await.map_err(upstream)
        })
        .await
        .map_err(|_| SearchError::Timeout(BACKEND))??;

        let results = parsed
            .results
            .into_iter()
            .map(|r| SearchResult {
                rank: 0,
                title: r.title.unwrap_or_default(),
                url: r.url,
                excerpt: join_excerpts(r.excerpts),
            })
            .collect();

        Ok(BackendOutput {
            results: rank_results(results, MAX_RESULTS),
            images: Vec::new(),
        })
    }

    async fn images(&self, _query: &str, _api_key: &str) -> Result<Vec<String>, SearchError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let queries = vec!["rust async runtime".to_string(), "tokio scheduler".to_string()];
        let body = ParallelRequest {
            objective: "how does tokio schedule tasks",
            search_queries: &queries,
            processor: "base",
            max_results: MAX_RESULTS,
            max_chars_per_result: MAX_CHARS_PER_RESULT,
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["objective"], "how does tokio schedule tasks");
        assert_eq!(json["search_queries"].as_array().unwrap().len(), 2);
        assert_eq!(json["processor"], "base");
        assert_eq!(json["max_results"], 10);
        assert_eq!(json["max_chars_per_result"], 6000);
    }

    #[test]
    fn excerpts_are_joined_by_newline() {
        let joined = join_excerpts(vec!["first".into(), "  ".into(), "second ".into()]);
        assert_eq!(joined, "first\nsecond");
    }

    #[test]
    fn parses_results_without_title() {
        let parsed: ParallelResponse = serde_json::from_str(
            r#"{"search_id": "s1", "results": [{"url": "https://docs.rs/tokio", "excerpts": ["a", "b"]}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.results[0].title, None);
        assert_eq!(parsed.results[0].excerpts.len(), 2);
    }
}
