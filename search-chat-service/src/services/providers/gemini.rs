//! Gemini generation engine.
//!
//! Streams `streamGenerateContent` over SSE and surfaces `functionCall`
//! parts as tool-call events.

use super::{
    EngineEvent, EngineStream, FinishReason, GenerationEngine, GenerationRequest, ProviderError,
    ToolDeclaration, ToolInvocation, Turn,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Gemini provider configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// Service key. A request's own key takes precedence.
    pub api_key: Option<String>,
    pub base_url: String,
}

/// Gemini engine.
pub struct GeminiEngine {
    config: GeminiConfig,
    client: Client,
}

impl GeminiEngine {
    pub fn new(config: GeminiConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    fn api_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    fn resolve_key(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        request
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.config.api_key.clone())
            .ok_or_else(|| ProviderError::NotConfigured("Gemini API key not configured".to_string()))
    }

    async fn post(
        &self,
        url: &str,
        key: &str,
        body: &GenerateContentRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited);
            }

            return Err(ProviderError::ApiError(format!(
                "Gemini API error {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

/// Convert pipeline turns into Gemini contents.
fn build_contents(turns: &[Turn]) -> Vec<Content> {
    turns
        .iter()
        .map(|turn| match turn {
            Turn::User(text) => Content {
                role: Some("user".to_string()),
                parts: vec![ContentPart::Text { text: text.clone() }],
            },
            Turn::Assistant(text) => Content {
                role: Some("model".to_string()),
                parts: vec![ContentPart::Text { text: text.clone() }],
            },
            Turn::ToolCall { name, args } => Content {
                role: Some("model".to_string()),
                parts: vec![ContentPart::FunctionCall {
                    function_call: FunctionCall {
                        name: name.clone(),
                        args: args.clone(),
                    },
                }],
            },
            Turn::ToolResult { name, result } => Content {
                role: Some("user".to_string()),
                parts: vec![ContentPart::FunctionResponse {
                    function_response: FunctionResponse {
                        name: name.clone(),
                        response: serde_json::json!({ "content": result }),
                    },
                }],
            },
        })
        .collect()
}

fn build_request(request: &GenerationRequest) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: build_contents(&request.turns),
        system_instruction: request.system_instruction.as_ref().map(|text| Content {
            role: None,
            parts: vec![ContentPart::Text { text: text.clone() }],
        }),
        tools: if request.tools.is_empty() {
            None
        } else {
            Some(vec![ToolSet {
                function_declarations: request.tools.clone(),
            }])
        },
        generation_config: Some(GenerationConfig {
            temperature: request.temperature,
        }),
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Complete,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
        _ => FinishReason::Complete,
    }
}

/// Pull every complete SSE `data:` payload out of `buffer`, leaving any
/// partial event in place.
fn drain_sse_events(buffer: &mut String) -> Vec<String> {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n");
    }

    let mut events = Vec::new();
    while let Some(event_end) = buffer.find("\n\n") {
        let event: String = buffer.drain(..event_end + 2).collect();
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.trim_start())
            .collect();
        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }
    events
}

/// Text and function-call events carried by one response chunk.
fn events_from_chunk(response: &GenerateContentResponse) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    if let Some(candidate) = response.candidates.first() {
        for part in candidate.content.iter().flat_map(|c| c.parts.iter()) {
            match part {
                ContentPart::Text { text } if !text.is_empty() => {
                    events.push(EngineEvent::Text(text.clone()));
                }
                ContentPart::FunctionCall { function_call } => {
                    events.push(EngineEvent::ToolCall(ToolInvocation {
                        name: function_call.name.clone(),
                        args: function_call.args.clone(),
                    }));
                }
                _ => {}
            }
        }
    }
    events
}

#[async_trait]
impl GenerationEngine for GeminiEngine {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn has_service_key(&self) -> bool {
        self.config
            .api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty())
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let key = self.resolve_key(request)?;
        let url = self.api_url(&request.model, "generateContent");

        tracing::debug!(
            model = %request.model,
            turns = request.turns.len(),
            "Sending request to Gemini API"
        );

        let response = self.post(&url, &key, &build_request(request)).await?;
        let api_response: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {}", e)))?;

        if let Some(reason) = api_response
            .candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
        {
            if map_finish_reason(reason) == FinishReason::ContentFilter {
                return Err(ProviderError::ContentFiltered);
            }
        }

        let text = events_from_chunk(&api_response)
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::Text(text) => Some(text),
                _ => None,
            })
            .collect::<String>();

        Ok(text)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineStream, ProviderError> {
        let key = self.resolve_key(request)?;
        let url = format!(
            "{}?alt=sse",
            self.api_url(&request.model, "streamGenerateContent")
        );

        tracing::debug!(
            model = %request.model,
            turns = request.turns.len(),
            tools = request.tools.len(),
            "Starting streaming request to Gemini API"
        );

        let body = build_request(request);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = self.post(&url, &key, &body) => response?,
        };

        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut total_input_tokens = 0i32;
            let mut total_output_tokens = 0i32;
            let mut last_finish_reason = FinishReason::Complete;
            let mut saw_tool_call = false;

            loop {
                let chunk_result = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Gemini stream cancelled");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };

                let chunk = match chunk_result {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::NetworkError(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for data in drain_sse_events(&mut buffer) {
                    let Ok(response) = serde_json::from_str::<GenerateContentResponse>(&data)
                    else {
                        tracing::warn!(payload_len = data.len(), "Skipping unparsable SSE event");
                        continue;
                    };

                    if let Some(usage) = &response.usage_metadata {
                        total_input_tokens = usage.prompt_token_count.unwrap_or(0);
                        total_output_tokens = usage.candidates_token_count.unwrap_or(0);
                    }

                    for event in events_from_chunk(&response) {
                        if matches!(event, EngineEvent::ToolCall(_)) {
                            saw_tool_call = true;
                        }
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }

                    if let Some(reason) = response
                        .candidates
                        .first()
                        .and_then(|c| c.finish_reason.as_deref())
                    {
                        last_finish_reason = map_finish_reason(reason);
                    }
                }
            }

            if saw_tool_call && last_finish_reason == FinishReason::Complete {
                last_finish_reason = FinishReason::ToolCall;
            }

            let _ = tx
                .send(Ok(EngineEvent::Complete {
                    input_tokens: total_input_tokens,
                    output_tokens: total_output_tokens,
                    finish_reason: last_finish_reason,
                }))
                .await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as EngineStream)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let Some(key) = self.config.api_key.as_deref() else {
            return Err(ProviderError::NotConfigured(
                "Gemini API key not configured".to_string(),
            ));
        };

        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", key)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::ApiError(format!(
                "Health check failed: {}",
                response.status()
            )))
        }
    }
}

// ============================================================================
// Gemini API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet {
    function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum ContentPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponse,
    },
    Other(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<i32>,
    candidates_token_count: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drains_complete_events_and_keeps_partial() {
        let mut buffer = "data: {\"a\":1}\r\n\r\ndata: {\"b\":2}\n\ndata: {\"c\"".to_string();
        let events = drain_sse_events(&mut buffer);

        assert_eq!(events, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buffer, "data: {\"c\"");
    }

    #[test]
    fn function_call_parts_become_tool_events() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "Checking. "},
                        {"functionCall": {"name": "weather", "args": {"location": "Paris"}}}
                    ]
                }
            }]
        }))
        .unwrap();

        let events = events_from_chunk(&response);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], EngineEvent::Text("Checking. ".to_string()));
        assert_eq!(
            events[1],
            EngineEvent::ToolCall(ToolInvocation {
                name: "weather".to_string(),
                args: json!({"location": "Paris"}),
            })
        );
    }

    #[test]
    fn request_serializes_tools_and_tool_turns() {
        let request = GenerationRequest {
            model: "gemini-2.0-flash".to_string(),
            system_instruction: Some("sys".to_string()),
            turns: vec![
                Turn::User("hi".to_string()),
                Turn::ToolCall {
                    name: "greeting".to_string(),
                    args: json!({"style": "casual"}),
                },
                Turn::ToolResult {
                    name: "greeting".to_string(),
                    result: json!({"greeting": "Hey"}),
                },
            ],
            tools: vec![ToolDeclaration {
                name: "greeting".to_string(),
                description: "Greets".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            temperature: Some(0.5),
            api_key: None,
        };

        let body = serde_json::to_value(build_request(&request)).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["name"], "greeting");
        assert_eq!(
            body["contents"][2]["parts"][0]["functionResponse"]["response"]["content"]["greeting"],
            "Hey"
        );
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "greeting");
    }

    #[test]
    fn request_key_overrides_service_key() {
        let engine = GeminiEngine::new(GeminiConfig {
            api_key: Some("service".to_string()),
            base_url: "http://localhost".to_string(),
        });
        let request = GenerationRequest {
            api_key: Some("own".to_string()),
            ..Default::default()
        };
        assert_eq!(engine.resolve_key(&request).unwrap(), "own");

        let no_key = GeminiEngine::new(GeminiConfig {
            api_key: None,
            base_url: "http://localhost".to_string(),
        });
        assert!(matches!(
            no_key.resolve_key(&GenerationRequest::default()),
            Err(ProviderError::NotConfigured(_))
        ));
    }
}
