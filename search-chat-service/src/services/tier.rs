//! Tier/Credit Authority. Read-only: it never debits.

use crate::config::ModelSpec;
use crate::error::PipelineError;
use crate::models::{ModelClass, Tier};
use crate::services::gate::Caller;
use crate::services::stores::CreditStore;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierReason {
    Admin,
    OwnKey,
    /// Balance left in the model's class before this request.
    Balance(i64),
    GuestFreeModel,
    ModelUnavailable,
    TierRestricted,
    InsufficientCredits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierDecision {
    pub allowed: bool,
    pub reason: TierReason,
    /// Admin callers skip the ledger entirely.
    pub tier: Option<Tier>,
}

impl TierDecision {
    fn allow(reason: TierReason, tier: Option<Tier>) -> Self {
        Self {
            allowed: true,
            reason,
            tier,
        }
    }

    fn deny(reason: TierReason, tier: Option<Tier>) -> Self {
        Self {
            allowed: false,
            reason,
            tier,
        }
    }

    /// Map a denial onto the pipeline error taxonomy.
    pub fn into_result(self, model: &ModelSpec) -> Result<Self, PipelineError> {
        if self.allowed {
            return Ok(self);
        }
        Err(match self.reason {
            TierReason::ModelUnavailable => PipelineError::ModelUnavailable(model.id.clone()),
            TierReason::TierRestricted => PipelineError::TierRestricted(model.id.clone()),
            _ => PipelineError::InsufficientCredits,
        })
    }
}

pub struct TierAuthority {
    credits: Arc<dyn CreditStore>,
}

impl TierAuthority {
    pub fn new(credits: Arc<dyn CreditStore>) -> Self {
        Self { credits }
    }

    /// Decide whether `caller` may use `model`.
    ///
    /// Order: admin bypasses everything; model availability; own key
    /// bypasses balances; otherwise the class balance must be positive.
    pub async fn evaluate(
        &self,
        model: &ModelSpec,
        caller: &Caller,
        own_key: bool,
    ) -> Result<TierDecision, PipelineError> {
        let user_id = match caller {
            Caller::Guest { .. } => {
                return Ok(if !model.available {
                    TierDecision::deny(TierReason::ModelUnavailable, None)
                } else if model.class != ModelClass::Free {
                    TierDecision::deny(TierReason::TierRestricted, None)
                } else {
                    TierDecision::allow(TierReason::GuestFreeModel, None)
                });
            }
            Caller::User { user_id, .. } => user_id,
        };

        let account = self
            .credits
            .account(user_id)
            .await
            .map_err(|e| PipelineError::Processing(anyhow::Error::new(e)))?;
        let tier = Some(account.tier);

        if account.tier == Tier::Admin {
            return Ok(TierDecision::allow(TierReason::Admin, tier));
        }
        if !model.available {
            return Ok(TierDecision::deny(TierReason::ModelUnavailable, tier));
        }
        if own_key {
            return Ok(TierDecision::allow(TierReason::OwnKey, tier));
        }

        let remaining = account.balances.get(model.class);
        let decision = if remaining > 0 {
            TierDecision::allow(TierReason::Balance(remaining), tier)
        } else {
            TierDecision::deny(TierReason::InsufficientCredits, tier)
        };

        tracing::debug!(
            user_id = %user_id,
            model = %model.id,
            class = model.class.as_str(),
            remaining,
            allowed = decision.allowed,
            "Tier decision"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreditAccount, CreditBalances};
    use crate::services::stores::InMemoryCreditStore;

    fn spec(class: ModelClass, available: bool) -> ModelSpec {
        ModelSpec {
            id: "m".to_string(),
            provider_model: "m".to_string(),
            class,
            available,
        }
    }

    fn user(id: &str) -> Caller {
        Caller::User {
            user_id: id.to_string(),
            email_verified: true,
        }
    }

    fn authority() -> TierAuthority {
        let broke = CreditAccount::new("broke", Tier::Pro).with_balances(CreditBalances::default());
        TierAuthority::new(Arc::new(
            InMemoryCreditStore::new()
                .with_account(broke)
                .with_account(CreditAccount::new("admin", Tier::Admin)),
        ))
    }

    #[tokio::test]
    async fn admin_bypasses_everything() {
        let decision = authority()
            .evaluate(&spec(ModelClass::SuperPremium, false), &user("admin"), false)
            .await
            .unwrap();
        assert_eq!(decision.reason, TierReason::Admin);
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn own_key_bypasses_balance_but_not_availability() {
        let auth = authority();
        let allowed = auth
            .evaluate(&spec(ModelClass::Premium, true), &user("broke"), true)
            .await
            .unwrap();
        assert_eq!(allowed.reason, TierReason::OwnKey);

        let denied = auth
            .evaluate(&spec(ModelClass::Premium, false), &user("broke"), true)
            .await
            .unwrap();
        assert_eq!(denied.reason, TierReason::ModelUnavailable);
        assert!(matches!(
            denied.into_result(&spec(ModelClass::Premium, false)),
            Err(PipelineError::ModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn empty_balance_is_insufficient() {
        let model = spec(ModelClass::Premium, true);
        let decision = authority().evaluate(&model, &user("broke"), false).await.unwrap();
        assert!(!decision.allowed);
        assert!(matches!(
            decision.into_result(&model),
            Err(PipelineError::InsufficientCredits)
        ));
    }

    #[tokio::test]
    async fn fresh_account_uses_free_allowance() {
        let decision = authority()
            .evaluate(&spec(ModelClass::Free, true), &user("newcomer"), false)
            .await
            .unwrap();
        assert_eq!(decision.reason, TierReason::Balance(50));
    }

    #[tokio::test]
    async fn evaluation_does_not_debit() {
        let auth = authority();
        let model = spec(ModelClass::Free, true);
        for _ in 0..3 {
            let decision = auth.evaluate(&model, &user("newcomer"), false).await.unwrap();
            assert_eq!(decision.reason, TierReason::Balance(50));
        }
    }

    #[tokio::test]
    async fn guests_get_free_models_only() {
        let guest = Caller::Guest {
            anonymous_id: "anon:1".to_string(),
        };
        let auth = authority();
        assert!(auth.evaluate(&spec(ModelClass::Free, true), &guest, false).await.unwrap().allowed);
        assert_eq!(
            auth.evaluate(&spec(ModelClass::Premium, true), &guest, false)
                .await
                .unwrap()
                .reason,
            TierReason::TierRestricted
        );
    }
}
