//! Sub-query derivation for the multi-query backend.

use crate::models::{SearchQuery, MAX_SUB_QUERIES};
use crate::services::providers::{GenerationEngine, GenerationRequest, Turn};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

const EXPANSION_INSTRUCTION: &str = "You turn a user's question into web search queries. \
Return between 1 and 5 short, distinct search queries, one per line. \
Do not number them, do not add commentary.";

static LIST_MARKUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+[.)]|[-*•])\s+").expect("valid regex"));

/// Asks the generation engine for up to five sub-queries. Any failure or
/// timeout degrades to the raw query alone.
pub struct QueryExpander {
    engine: Arc<dyn GenerationEngine>,
    model: String,
    timeout: Duration,
}

impl QueryExpander {
    pub fn new(engine: Arc<dyn GenerationEngine>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            engine,
            model: model.into(),
            timeout,
        }
    }

    pub async fn expand(&self, raw: &str, api_key: Option<&str>) -> SearchQuery {
        let request = GenerationRequest {
            model: self.model.clone(),
            system_instruction: Some(EXPANSION_INSTRUCTION.to_string()),
            turns: vec![Turn::User(raw.to_string())],
            temperature: Some(0.2),
            api_key: api_key.map(str::to_string),
            ..Default::default()
        };

        match tokio::time::timeout(self.timeout, self.engine.generate(&request)).await {
            Ok(Ok(text)) => {
                let query = SearchQuery::expanded(raw, parse_sub_queries(&text));
                tracing::debug!(count = query.sub_queries.len(), "Expanded search query");
                query
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Query expansion failed, using raw query");
                SearchQuery::single(raw)
            }
            Err(_) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "Query expansion timed out, using raw query");
                SearchQuery::single(raw)
            }
        }
    }
}

/// One query per line, with list bullets, numbering and quotes stripped.
fn parse_sub_queries(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            let line = line.trim();
            LIST_MARKUP_RE
                .replace(line, "")
                .trim()
                .trim_matches('"')
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .take(MAX_SUB_QUERIES)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::mock::ScriptedEngine;

    #[test]
    fn strips_list_markup() {
        let parsed = parse_sub_queries("1. rust async\n- \"tokio runtime\"\n\n* futures crate\n");
        assert_eq!(parsed, vec!["rust async", "tokio runtime", "futures crate"]);
    }

    #[test]
    fn keeps_leading_numbers_that_are_part_of_the_query() {
        let parsed = parse_sub_queries("2024 olympics medal table
3D printing
2) 1990s films
");
        assert_eq!(
            parsed,
            vec!["2024 olympics medal table", "3D printing", "1990s films"]
        );
    }

    #[tokio::test]
    async fn expands_with_engine_completion() {
        let engine = Arc::new(ScriptedEngine::new().with_completion("paris population\nparis area"));
        let expander = QueryExpander::new(engine.clone(), "gemini-2.0-flash", Duration::from_secs(8));

        let query = expander.expand("tell me about paris", None).await;
        assert_eq!(query.raw, "tell me about paris");
        assert_eq!(query.sub_queries, vec!["paris population", "paris area"]);
        assert_eq!(engine.completion_requests()[0].model, "gemini-2.0-flash");
    }

    #[tokio::test]
    async fn falls_back_to_raw_query_on_failure() {
        let engine = Arc::new(ScriptedEngine::new());
        let expander = QueryExpander::new(engine, "gemini-2.0-flash", Duration::from_secs(8));

        let query = expander.expand("tell me about paris", None).await;
        assert_eq!(query, SearchQuery::single("tell me about paris"));
    }
}
