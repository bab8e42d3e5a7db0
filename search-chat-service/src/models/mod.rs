//! Domain models for the search chat service.

pub mod chat;
pub mod credit;
pub mod search;
pub mod session;

pub use chat::{ChatMessage, ChatRequest, ConversationStyle, Role};
pub use credit::{
    CreditAccount, CreditBalances, CreditTransaction, DebitOutcome, ModelClass, Tier,
};
pub use search::{
    is_absolute_http_url, ImageList, SearchQuery, SearchResult, MAX_IMAGES, MAX_SUB_QUERIES,
};
pub use session::{GenerationSession, SessionState, ToolCallRecord};
