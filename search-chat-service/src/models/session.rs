//! Per-stream generation session and its state machine.

use super::search::{ImageList, SearchResult};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Pipeline state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Validating,
    Searching,
    Debiting,
    Prompting,
    Generating,
    ToolCall,
    Finished,
    Aborted,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Aborted | SessionState::Errored
        )
    }

    /// Allowed edges. `Aborted` and `Errored` are reachable from every
    /// non-terminal state; `Searching` may be skipped when web search is off.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Aborted | Errored) {
            return true;
        }

        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Searching)
                | (Validating, Debiting)
                | (Searching, Debiting)
                | (Debiting, Prompting)
                | (Prompting, Generating)
                | (Generating, ToolCall)
                | (ToolCall, Generating)
                | (Generating, Finished)
        )
    }
}

/// A completed tool invocation, in call order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub args: Value,
    pub result: Value,
}

/// Mutable state that lives exactly as long as one response stream.
#[derive(Debug)]
pub struct GenerationSession {
    pub request_id: String,
    state: SessionState,
    pub abort: CancellationToken,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Everything emitted to the client so far, markers included.
    pub text: String,
    /// Known sources in discovery order. Citation URLs must come from here.
    pub results: Vec<SearchResult>,
    pub images: ImageList,
}

impl GenerationSession {
    pub fn new(request_id: impl Into<String>, abort: CancellationToken) -> Self {
        Self {
            request_id: request_id.into(),
            state: SessionState::Idle,
            abort,
            tool_calls: Vec::new(),
            text: String::new(),
            results: Vec::new(),
            images: ImageList::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Invalid edges are refused and leave the state as is.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                request_id = %self.request_id,
                from = ?self.state,
                to = ?next,
                "Refused invalid session transition"
            );
            return false;
        }
        tracing::debug!(
            request_id = %self.request_id,
            from = ?self.state,
            to = ?next,
            "Session transition"
        );
        self.state = next;
        true
    }

    /// Add results, re-ranking them after the ones already known and
    /// skipping URLs that are already present.
    pub fn add_results(&mut self, results: Vec<SearchResult>) -> Vec<SearchResult> {
        let mut added = Vec::new();
        for mut result in results {
            if self.results.iter().any(|known| known.url == result.url) {
                continue;
            }
            result.rank = self.results.len() + 1;
            self.results.push(result.clone());
            added.push(result);
        }
        added
    }

    pub fn known_urls(&self) -> Vec<String> {
        self.results.iter().map(|r| r.url.clone()).collect()
    }
}
