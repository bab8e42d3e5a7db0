//! Web search backends and the per-request orchestrator.
//!
//! Two interchangeable backends sit behind [`SearchBackend`]:
//! - `parallel`: objective-driven, multi-query, no images.
//! - `tavily`: single keyword query with image extraction.
//!
//! The backend is chosen once per request; nothing downstream branches on it.

pub mod expander;
pub mod images;
pub mod orchestrator;
pub mod parallel;
pub mod tavily;

pub use expander::QueryExpander;
pub use orchestrator::{SearchKeys, SearchOrchestrator, SearchOutcome, SearchPlan};
pub use parallel::ParallelBackend;
pub use tavily::TavilyBackend;

use crate::error::PipelineError;
use crate::models::{SearchQuery, SearchResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Which provider answers the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Broad crawler: expanded sub-queries, excerpts, no images.
    Parallel,
    /// Direct keyword search with images.
    Tavily,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Parallel => "parallel",
            BackendKind::Tavily => "tavily",
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(BackendKind::Parallel),
            "tavily" => Ok(BackendKind::Tavily),
            other => Err(format!("unknown search backend: {}", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("no API key configured for {0}")]
    MissingKey(&'static str),

    #[error("{backend} request failed: {message}")]
    Upstream {
        backend: &'static str,
        message: String,
    },

    #[error("{0} search timed out")]
    Timeout(&'static str),
}

impl From<SearchError> for PipelineError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::MissingKey(backend) => PipelineError::MissingKey(backend.to_string()),
            SearchError::Timeout(backend) => {
                PipelineError::UpstreamTimeout(format!("{} search", backend))
            }
            err @ SearchError::Upstream { .. } => PipelineError::Upstream(anyhow::Error::new(err)),
        }
    }
}

/// Normalized output of one backend call. Images are raw, unfiltered URLs.
#[derive(Debug, Clone, Default)]
pub struct BackendOutput {
    pub results: Vec<SearchResult>,
    pub images: Vec<String>,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run the query (all sub-queries for multi-query backends).
    async fn search(&self, query: &SearchQuery, api_key: &str) -> Result<BackendOutput, SearchError>;

    /// Image-only lookup for a single query. Backends without images
    /// return an empty list.
    async fn images(&self, query: &str, api_key: &str) -> Result<Vec<String>, SearchError>;
}

/// Rank results 1..n, dropping ones without an absolute http(s) URL.
pub(crate) fn rank_results(results: Vec<SearchResult>, max: usize) -> Vec<SearchResult> {
    results
        .into_iter()
        .filter(|r| crate::models::is_absolute_http_url(&r.url))
        .take(max)
        .enumerate()
        .map(|(i, mut r)| {
            r.rank = i + 1;
            if r.title.trim().is_empty() {
                r.title = r.url.clone();
            }
            r
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("Tavily".parse::<BackendKind>().unwrap(), BackendKind::Tavily);
        assert_eq!(" parallel ".parse::<BackendKind>().unwrap(), BackendKind::Parallel);
        assert!("bing".parse::<BackendKind>().is_err());
    }

    #[test]
    fn rank_results_filters_and_numbers() {
        let raw = vec![
            SearchResult {
                rank: 0,
                title: "".to_string(),
                url: "https://a.com".to_string(),
                excerpt: "x".to_string(),
            },
            SearchResult {
                rank: 0,
                title: "bad".to_string(),
                url: "/relative".to_string(),
                excerpt: "x".to_string(),
            },
            SearchResult {
                rank: 0,
                title: "B".to_string(),
                url: "http://b.com".to_string(),
                excerpt: "y".to_string(),
            },
        ];

        let ranked = rank_results(raw, 10);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].title, "https://a.com");
        assert_eq!(ranked[1].rank, 2);
    }

    #[test]
    fn timeout_maps_to_upstream_timeout() {
        let err: PipelineError = SearchError::Timeout("tavily").into();
        assert!(matches!(err, PipelineError::UpstreamTimeout(_)));
    }
}
