//! Scripted engine for tests.

use super::{
    EngineEvent, EngineStream, FinishReason, GenerationEngine, GenerationRequest, ProviderError,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Engine that replays pre-recorded turns and records every request.
///
/// Each call to `generate_stream` pops the next scripted turn. When the script
/// runs out a short plain-text turn is returned.
pub struct ScriptedEngine {
    turns: Mutex<VecDeque<Vec<EngineEvent>>>,
    completion: Option<String>,
    fail_stream_open: bool,
    service_key: bool,
    event_delay: Option<Duration>,
    stream_requests: Mutex<Vec<GenerationRequest>>,
    completion_requests: Mutex<Vec<GenerationRequest>>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            completion: None,
            fail_stream_open: false,
            service_key: true,
            event_delay: None,
            stream_requests: Mutex::new(Vec::new()),
            completion_requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue one streamed turn.
    pub fn with_turn(self, events: Vec<EngineEvent>) -> Self {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(events);
        self
    }

    /// Queue a text-only turn built from `chunks`.
    pub fn with_text_turn(self, chunks: &[&str]) -> Self {
        let mut events: Vec<EngineEvent> = chunks
            .iter()
            .map(|c| EngineEvent::Text(c.to_string()))
            .collect();
        events.push(complete(FinishReason::Complete));
        self.with_turn(events)
    }

    /// Text returned by `generate`. Without one, `generate` fails.
    pub fn with_completion(mut self, text: impl Into<String>) -> Self {
        self.completion = Some(text.into());
        self
    }

    pub fn failing_stream_open(mut self) -> Self {
        self.fail_stream_open = true;
        self
    }

    /// Behave like an engine deployed without a service key.
    pub fn without_service_key(mut self) -> Self {
        self.service_key = false;
        self
    }

    /// Pause between streamed events.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    pub fn stream_requests(&self) -> Vec<GenerationRequest> {
        self.stream_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn completion_requests(&self) -> Vec<GenerationRequest> {
        self.completion_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Convenience constructor for the closing event of a turn.
pub fn complete(finish_reason: FinishReason) -> EngineEvent {
    EngineEvent::Complete {
        input_tokens: 10,
        output_tokens: 5,
        finish_reason,
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn has_service_key(&self) -> bool {
        self.service_key
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.completion_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        self.completion
            .clone()
            .ok_or_else(|| ProviderError::ApiError("no scripted completion".to_string()))
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<EngineStream, ProviderError> {
        self.stream_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if self.fail_stream_open {
            return Err(ProviderError::ApiError("scripted failure".to_string()));
        }

        let events = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    EngineEvent::Text("Mock response.".to_string()),
                    complete(FinishReason::Complete),
                ]
            });

        let delay = self.event_delay;
        let stream = tokio_stream::iter(events)
            .then(move |event| async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, ProviderError>(event)
            })
            .take_until(cancel.cancelled_owned());

        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
