//! Plan tiers, model classes and credit transactions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription tier of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Max,
    Admin,
}

/// Pricing class of a model. Each class has its own balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelClass {
    Free,
    Premium,
    SuperPremium,
}

impl ModelClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Free => "free",
            ModelClass::Premium => "premium",
            ModelClass::SuperPremium => "super_premium",
        }
    }
}

/// Remaining message credits per model class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalances {
    pub free: i64,
    pub premium: i64,
    pub super_premium: i64,
}

impl CreditBalances {
    pub fn get(&self, class: ModelClass) -> i64 {
        match class {
            ModelClass::Free => self.free,
            ModelClass::Premium => self.premium,
            ModelClass::SuperPremium => self.super_premium,
        }
    }

    pub fn get_mut(&mut self, class: ModelClass) -> &mut i64 {
        match class {
            ModelClass::Free => &mut self.free,
            ModelClass::Premium => &mut self.premium,
            ModelClass::SuperPremium => &mut self.super_premium,
        }
    }

    /// Starting allowance for a newly provisioned account of `tier`.
    pub fn allowance_for(tier: Tier) -> Self {
        match tier {
            Tier::Free => CreditBalances {
                free: 50,
                premium: 5,
                super_premium: 0,
            },
            Tier::Pro => CreditBalances {
                free: 1000,
                premium: 300,
                super_premium: 20,
            },
            Tier::Max => CreditBalances {
                free: 5000,
                premium: 1500,
                super_premium: 200,
            },
            Tier::Admin => CreditBalances::default(),
        }
    }
}

/// An account as seen by the tier/credit store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: String,
    pub tier: Tier,
    pub balances: CreditBalances,
}

impl CreditAccount {
    pub fn new(user_id: impl Into<String>, tier: Tier) -> Self {
        Self {
            user_id: user_id.into(),
            tier,
            balances: CreditBalances::allowance_for(tier),
        }
    }

    pub fn with_balances(mut self, balances: CreditBalances) -> Self {
        self.balances = balances;
        self
    }
}

/// How a debit attempt ended from the pipeline's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebitOutcome {
    Committed,
    TimedOut,
    Denied,
}

impl DebitOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebitOutcome::Committed => "committed",
            DebitOutcome::TimedOut => "timed_out",
            DebitOutcome::Denied => "denied",
        }
    }
}

/// One debit attempt. Created once per request and never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub transaction_id: String,
    pub user_id: String,
    pub model: String,
    pub model_class: ModelClass,
    pub using_own_key: bool,
    pub outcome: DebitOutcome,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub attempted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balances_are_addressed_by_class() {
        let mut balances = CreditBalances {
            free: 3,
            premium: 2,
            super_premium: 1,
        };
        *balances.get_mut(ModelClass::Premium) -= 1;

        assert_eq!(balances.get(ModelClass::Free), 3);
        assert_eq!(balances.get(ModelClass::Premium), 1);
        assert_eq!(balances.get(ModelClass::SuperPremium), 1);
    }

    #[test]
    fn free_tier_has_no_super_premium_allowance() {
        let account = CreditAccount::new("u1", Tier::Free);
        assert_eq!(account.balances.get(ModelClass::SuperPremium), 0);
        assert!(account.balances.get(ModelClass::Free) > 0);
    }
}
