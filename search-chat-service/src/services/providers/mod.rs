//! Generation engine abstraction.
//!
//! The engine is an opaque token-streaming service with function calling.
//! The pipeline only depends on [`GenerationEngine`]; Gemini is the production
//! implementation and [`mock::ScriptedEngine`] drives tests.

pub mod gemini;
pub mod mock;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Content filtered")]
    ContentFiltered,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
    ContentFilter,
    ToolCall,
    Error,
}

/// A structured function-call request emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub args: Value,
}

/// One event of a streamed generation turn.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Text delta.
    Text(String),

    /// The engine wants a tool result before it continues.
    ToolCall(ToolInvocation),

    /// Final event of the turn.
    Complete {
        input_tokens: i32,
        output_tokens: i32,
        finish_reason: FinishReason,
    },
}

/// Type alias for engine streams.
pub type EngineStream = Pin<Box<dyn Stream<Item = Result<EngineEvent, ProviderError>> + Send>>;

/// Conversation entry sent to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    User(String),
    Assistant(String),
    ToolCall { name: String, args: Value },
    ToolResult { name: String, result: Value },
}

/// Function declaration offered to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the arguments.
    pub parameters: Value,
}

/// Everything the engine needs for one generation turn.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// Provider model id.
    pub model: String,
    pub system_instruction: Option<String>,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDeclaration>,
    pub temperature: Option<f32>,
    /// Caller-supplied key; overrides the service key for this request.
    pub api_key: Option<String>,
}

/// Trait for streaming generation engines with tool calling.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether requests without their own key can still be served.
    fn has_service_key(&self) -> bool {
        true
    }

    /// Non-streaming completion, used for auxiliary calls.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;

    /// Open a streamed turn. The stream ends after `Complete`, on error, or
    /// as soon as `cancel` fires.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineStream, ProviderError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), ProviderError>;
}
