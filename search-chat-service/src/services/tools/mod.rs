//! Mid-stream tools the generation engine can call.
//!
//! Each tool takes typed arguments decoded from the engine's function call.
//! Failures are returned to the engine as an error result, never to the
//! client.

pub mod greeting;
pub mod retrieval;
pub mod weather;

pub use greeting::{greet, GreetingArgs, GreetingStyle};
pub use retrieval::{first_url, FetchedPage, PageFetcher, RetrievalArgs};
pub use weather::{TemperatureUnit, WeatherArgs, WeatherClient};

use crate::models::{GenerationSession, SearchResult};
use crate::services::providers::{ToolDeclaration, ToolInvocation};
use crate::services::search::{SearchOrchestrator, SearchPlan};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool not available for this request: {0}")]
    NotAvailable(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream failure: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    Search,
    Retrieval,
    Weather,
    Greeting,
}

impl ToolName {
    pub const ALL: [ToolName; 4] = [
        ToolName::Search,
        ToolName::Retrieval,
        ToolName::Weather,
        ToolName::Greeting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Search => "search",
            ToolName::Retrieval => "retrieval",
            ToolName::Weather => "weather",
            ToolName::Greeting => "greeting",
        }
    }

    pub fn declaration(&self) -> ToolDeclaration {
        let (description, parameters) = match self {
            ToolName::Search => (
                "Search the web for current information. Returns numbered sources with URLs you may cite.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "Search query"}
                    },
                    "required": ["query"]
                }),
            ),
            ToolName::Retrieval => (
                "Fetch a web page and return its title, summary and text.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "description": "Absolute http(s) URL"}
                    },
                    "required": ["url"]
                }),
            ),
            ToolName::Weather => (
                "Get current weather conditions for a location.",
                json!({
                    "type": "object",
                    "properties": {
                        "location": {"type": "string", "description": "City or place name"},
                        "unit": {"type": "string", "enum": ["celsius", "fahrenheit"]}
                    },
                    "required": ["location"]
                }),
            ),
            ToolName::Greeting => (
                "Greet the user.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Name of the person to greet"},
                        "style": {"type": "string", "enum": ["formal", "casual", "enthusiastic"]}
                    }
                }),
            ),
        };

        ToolDeclaration {
            name: self.as_str().to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

impl FromStr for ToolName {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ToolError::UnknownTool(s.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchArgs {
    pub query: String,
}

fn decode_args<T: DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// What a single response may call, and with which search plan.
pub struct ToolScope<'a> {
    pub enabled: &'a [ToolName],
    pub search: Option<&'a SearchPlan>,
}

pub struct ToolBox {
    orchestrator: Arc<SearchOrchestrator>,
    pages: Arc<PageFetcher>,
    weather: WeatherClient,
}

fn results_json(results: &[SearchResult]) -> Vec<Value> {
    results
        .iter()
        .map(|r| {
            json!({
                "index": r.rank,
                "title": r.title,
                "url": r.url,
                "content": r.excerpt,
            })
        })
        .collect()
}

impl ToolBox {
    pub fn new(
        orchestrator: Arc<SearchOrchestrator>,
        pages: Arc<PageFetcher>,
        weather: WeatherClient,
    ) -> Self {
        Self {
            orchestrator,
            pages,
            weather,
        }
    }

    /// Run one invocation. Sources the tool discovers are added to the
    /// session so they become citable and appear in the final markers.
    pub async fn dispatch(
        &self,
        call: &ToolInvocation,
        scope: &ToolScope<'_>,
        session: &mut GenerationSession,
    ) -> Result<Value, ToolError> {
        let tool: ToolName = call.name.parse()?;
        if !scope.enabled.contains(&tool) {
            return Err(ToolError::NotAvailable(tool.as_str().to_string()));
        }

        match tool {
            ToolName::Search => {
                let args: SearchArgs = decode_args(&call.args)?;
                let query = args.query.trim();
                if query.is_empty() {
                    return Err(ToolError::InvalidArguments("query is required".to_string()));
                }
                let plan = scope
                    .search
                    .ok_or_else(|| ToolError::NotAvailable(tool.as_str().to_string()))?;

                let outcome = self
                    .orchestrator
                    .search_single(plan, query)
                    .await
                    .map_err(|e| ToolError::Upstream(e.to_string()))?;

                let added = session.add_results(outcome.results);
                session.images.extend(outcome.images.as_slice());

                Ok(json!({
                    "query": query,
                    "results": results_json(&added),
                }))
            }
            ToolName::Retrieval => {
                let args: RetrievalArgs = decode_args(&call.args)?;
                let page = self.pages.fetch(&args.url).await?;
                let added = session.add_results(vec![SearchResult {
                    rank: 0,
                    title: page.card.title.clone(),
                    url: page.card.url.clone(),
                    excerpt: page.text.clone(),
                }]);
                let index = added
                    .first()
                    .map(|r| r.rank)
                    .or_else(|| {
                        session
                            .results
                            .iter()
                            .find(|r| r.url == page.card.url)
                            .map(|r| r.rank)
                    });

                Ok(json!({
                    "index": index,
                    "url": page.card.url,
                    "title": page.card.title,
                    "summary": page.card.summary,
                    "image": page.card.image,
                    "favicon": page.card.favicon,
                    "content": page.text,
                }))
            }
            ToolName::Weather => {
                let args: WeatherArgs = decode_args(&call.args)?;
                let report = self.weather.current(&args).await?;
                serde_json::to_value(report).map_err(|e| ToolError::Upstream(e.to_string()))
            }
            ToolName::Greeting => {
                let args: GreetingArgs = decode_args(&call.args)?;
                Ok(json!({ "greeting": greet(&args) }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_cover_all_tools() {
        let names: Vec<String> = ToolName::ALL.iter().map(|t| t.declaration().name).collect();
        assert_eq!(names, vec!["search", "retrieval", "weather", "greeting"]);

        let weather = ToolName::Weather.declaration();
        assert_eq!(weather.parameters["properties"]["unit"]["enum"][1], "fahrenheit");
    }

    #[test]
    fn tool_names_parse() {
        assert_eq!("weather".parse::<ToolName>().unwrap(), ToolName::Weather);
        assert!(matches!("shell".parse::<ToolName>(), Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn bad_arguments_are_reported() {
        let err = decode_args::<SearchArgs>(&json!({"q": "x"})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
