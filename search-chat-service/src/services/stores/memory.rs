//! DashMap-backed stores. Entry guards hold the shard lock across the whole
//! check-and-update, which makes each operation atomic per key.

use super::{
    ConsumeOutcome, CreditStore, DebitRequest, GuestQuotaStore, PreferenceStore, QuotaDecision,
    SearchPreferences, StoreError,
};
use crate::models::{CreditAccount, Tier};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Default)]
pub struct InMemoryCreditStore {
    accounts: DashMap<String, CreditAccount>,
    applied: DashMap<String, ConsumeOutcome>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(self, account: CreditAccount) -> Self {
        self.accounts.insert(account.user_id.clone(), account);
        self
    }

    pub fn upsert(&self, account: CreditAccount) {
        self.accounts.insert(account.user_id.clone(), account);
    }

    /// Number of transaction ids seen, duplicates excluded.
    pub fn transaction_count(&self) -> usize {
        self.applied.len()
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn account(&self, user_id: &str) -> Result<CreditAccount, StoreError> {
        Ok(self
            .accounts
            .get(user_id)
            .map(|a| a.clone())
            .unwrap_or_else(|| CreditAccount::new(user_id, Tier::Free)))
    }

    async fn consume(&self, debit: &DebitRequest) -> Result<ConsumeOutcome, StoreError> {
        let slot = match self.applied.entry(debit.transaction_id.clone()) {
            Entry::Occupied(_) => return Ok(ConsumeOutcome::Duplicate),
            Entry::Vacant(slot) => slot,
        };

        let mut account = self
            .accounts
            .entry(debit.user_id.clone())
            .or_insert_with(|| CreditAccount::new(&debit.user_id, Tier::Free));

        let outcome = if debit.using_own_key || account.tier == Tier::Admin {
            ConsumeOutcome::Applied
        } else {
            let balance = account.balances.get_mut(debit.model_class);
            if *balance > 0 {
                *balance -= 1;
                ConsumeOutcome::Applied
            } else {
                ConsumeOutcome::Insufficient
            }
        };

        slot.insert(outcome);
        Ok(outcome)
    }
}

#[derive(Default)]
pub struct InMemoryPreferenceStore {
    preferences: DashMap<String, SearchPreferences>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: impl Into<String>, preferences: SearchPreferences) {
        self.preferences.insert(user_id.into(), preferences);
    }
}

#[async_trait]
impl PreferenceStore for InMemoryPreferenceStore {
    async fn search_preferences(&self, user_id: &str) -> Result<SearchPreferences, StoreError> {
        Ok(self
            .preferences
            .get(user_id)
            .map(|p| p.clone())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryGuestQuotaStore {
    used: DashMap<String, u32>,
}

impl InMemoryGuestQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GuestQuotaStore for InMemoryGuestQuotaStore {
    async fn try_consume(&self, anonymous_id: &str, limit: u32) -> Result<QuotaDecision, StoreError> {
        let mut used = self.used.entry(anonymous_id.to_string()).or_insert(0);
        if *used >= limit {
            return Ok(QuotaDecision {
                allowed: false,
                used: *used,
            });
        }
        *used += 1;
        Ok(QuotaDecision {
            allowed: true,
            used: *used,
        })
    }
}
