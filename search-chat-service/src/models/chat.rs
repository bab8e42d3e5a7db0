//! Inbound chat request payload.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Conversation so far, oldest first. The last user message is the query.
    #[validate(length(min = 1, message = "messages must contain at least one message"), nested)]
    pub messages: Vec<ChatMessage>,

    /// Client-facing model id from the model catalog.
    #[validate(length(min = 1, message = "model is required"))]
    pub model: String,

    pub conversation_style: ConversationStyle,

    /// Caller-supplied generation engine key (BYOK).
    #[serde(default)]
    pub user_api_key: Option<String>,

    /// Caller-supplied search key, used when the service has none configured.
    #[serde(default)]
    pub user_search_api_key: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub is_guest: bool,

    /// Run the pre-generation web search and offer the search tool.
    #[serde(default = "default_web_search")]
    pub web_search: bool,
}

fn default_web_search() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChatMessage {
    pub role: Role,

    #[validate(length(max = 100000, message = "message content is too long"))]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Response style template selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStyle {
    #[serde(alias = "Balanced")]
    Balanced,
    #[serde(alias = "Creative")]
    Creative,
    #[serde(alias = "Precise")]
    Precise,
}

impl ChatRequest {
    /// Content of the most recent user message, trimmed.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.trim())
            .filter(|c| !c.is_empty())
    }

    pub fn has_own_key(&self) -> bool {
        self.user_api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty())
    }
}
