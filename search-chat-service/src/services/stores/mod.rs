//! Collaborator stores: tier/credit ledger, per-user search preferences and
//! the anonymous guest quota.
//!
//! Every store does read-modify-write atomically per key. Concurrent requests
//! from one identity never lose an update.

pub mod memory;

pub use memory::{InMemoryCreditStore, InMemoryGuestQuotaStore, InMemoryPreferenceStore};

use crate::models::{CreditAccount, ModelClass};
use crate::services::search::{BackendKind, SearchKeys};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0:#}")]
    Backend(anyhow::Error),
}

/// A single debit attempt as handed to the credit store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebitRequest {
    /// Idempotency key. A second `consume` with the same id is a no-op.
    pub transaction_id: String,
    pub user_id: String,
    pub model: String,
    pub model_class: ModelClass,
    pub using_own_key: bool,
}

/// What the store did with a debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Balance decremented, or recorded without decrement for own-key and
    /// admin callers.
    Applied,
    /// The transaction id was already applied earlier.
    Duplicate,
    /// Balance for the model class is exhausted.
    Insufficient,
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Current tier and balances. Unknown users read as a fresh free account.
    async fn account(&self, user_id: &str) -> Result<CreditAccount, StoreError>;

    /// Atomically check and decrement one credit of the request's model class.
    async fn consume(&self, debit: &DebitRequest) -> Result<ConsumeOutcome, StoreError>;
}

/// Stored per-user search settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPreferences {
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub parallel_api_key: Option<String>,
    #[serde(default)]
    pub tavily_api_key: Option<String>,
}

impl SearchPreferences {
    pub fn keys(&self) -> SearchKeys {
        SearchKeys {
            parallel: self.parallel_api_key.clone(),
            tavily: self.tavily_api_key.clone(),
        }
    }
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn search_preferences(&self, user_id: &str) -> Result<SearchPreferences, StoreError>;
}

/// Result of a guest quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Messages counted against the identifier, including this one when allowed.
    pub used: u32,
}

#[async_trait]
pub trait GuestQuotaStore: Send + Sync {
    /// Count one message for `anonymous_id` unless `limit` is already reached.
    async fn try_consume(&self, anonymous_id: &str, limit: u32) -> Result<QuotaDecision, StoreError>;
}
