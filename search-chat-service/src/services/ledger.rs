//! Credit Ledger Guard.
//!
//! The debit races a timer. The two losing sides have different policies:
//! - explicit denial aborts the request before any generation call;
//! - timeout is swallowed, logged, and the request continues as if the
//!   debit committed.
//!
//! A debit that resolves after the timeout is awaited by a detached
//! follower that logs and counts it. A late denial is an under-charge: the
//! response already went out, nothing is aborted, refunded or re-debited.

use crate::error::PipelineError;
use crate::models::{CreditTransaction, DebitOutcome, ModelClass};
use crate::services::metrics;
use crate::services::stores::{ConsumeOutcome, CreditStore, DebitRequest, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};

/// Who is being charged for what.
#[derive(Debug, Clone)]
pub struct DebitContext {
    pub request_id: String,
    pub user_id: String,
    pub model: String,
    pub model_class: ModelClass,
    pub using_own_key: bool,
}

pub struct LedgerGuard {
    store: Arc<dyn CreditStore>,
    timeout: Duration,
}

impl LedgerGuard {
    pub fn new(store: Arc<dyn CreditStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Debit one credit, waiting at most the configured timeout.
    #[tracing::instrument(skip_all, fields(request_id = %ctx.request_id, user_id = %ctx.user_id))]
    pub async fn debit(&self, ctx: &DebitContext) -> Result<CreditTransaction, PipelineError> {
        let debit = DebitRequest {
            transaction_id: uuid::Uuid::new_v4().to_string(),
            user_id: ctx.user_id.clone(),
            model: ctx.model.clone(),
            model_class: ctx.model_class,
            using_own_key: ctx.using_own_key,
        };
        let attempted_at = Utc::now();

        let store = self.store.clone();
        let pending = debit.clone();
        let mut handle = tokio::spawn(async move { store.consume(&pending).await });

        let outcome = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(joined) => settle(joined, &debit)?,
            Err(_) => {
                tracing::warn!(
                    transaction_id = %debit.transaction_id,
                    timeout_secs = self.timeout.as_secs(),
                    "Credit debit timed out, continuing optimistically"
                );
                follow_late_result(handle, debit.clone());
                DebitOutcome::TimedOut
            }
        };

        metrics::record_debit(outcome.as_str());
        Ok(CreditTransaction {
            transaction_id: debit.transaction_id,
            user_id: debit.user_id,
            model: debit.model,
            model_class: debit.model_class,
            using_own_key: debit.using_own_key,
            outcome,
            attempted_at,
        })
    }
}

fn settle(
    joined: Result<Result<ConsumeOutcome, StoreError>, JoinError>,
    debit: &DebitRequest,
) -> Result<DebitOutcome, PipelineError> {
    match joined {
        Ok(Ok(ConsumeOutcome::Applied | ConsumeOutcome::Duplicate)) => Ok(DebitOutcome::Committed),
        Ok(Ok(ConsumeOutcome::Insufficient)) => {
            metrics::record_debit(DebitOutcome::Denied.as_str());
            tracing::info!(
                transaction_id = %debit.transaction_id,
                class = debit.model_class.as_str(),
                "Credit debit denied"
            );
            Err(PipelineError::InsufficientCredits)
        }
        Ok(Err(e)) => {
            metrics::record_debit("error");
            Err(PipelineError::Processing(
                anyhow::Error::new(e).context("credit debit failed"),
            ))
        }
        Err(e) => {
            metrics::record_debit("error");
            Err(PipelineError::Processing(
                anyhow::Error::new(e).context("credit debit task failed"),
            ))
        }
    }
}

fn follow_late_result(
    handle: JoinHandle<Result<ConsumeOutcome, StoreError>>,
    debit: DebitRequest,
) {
    tokio::spawn(async move {
        let outcome = match handle.await {
            Ok(Ok(ConsumeOutcome::Applied)) => "committed",
            Ok(Ok(ConsumeOutcome::Duplicate)) => "duplicate",
            Ok(Ok(ConsumeOutcome::Insufficient)) => "denied",
            Ok(Err(_)) | Err(_) => "error",
        };
        metrics::record_late_debit(outcome);

        if outcome == "committed" || outcome == "duplicate" {
            tracing::info!(
                transaction_id = %debit.transaction_id,
                user_id = %debit.user_id,
                outcome,
                "Late credit debit resolved"
            );
        } else {
            tracing::warn!(
                transaction_id = %debit.transaction_id,
                user_id = %debit.user_id,
                model = %debit.model,
                outcome,
                "Late credit debit did not commit, recording under-charge"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreditAccount, CreditBalances, Tier};
    use crate::services::stores::InMemoryCreditStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps a store and delays every consume.
    struct SlowStore {
        inner: InMemoryCreditStore,
        delay: Duration,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl CreditStore for SlowStore {
        async fn account(&self, user_id: &str) -> Result<crate::models::CreditAccount, StoreError> {
            self.inner.account(user_id).await
        }

        async fn consume(&self, debit: &DebitRequest) -> Result<ConsumeOutcome, StoreError> {
            tokio::time::sleep(self.delay).await;
            let outcome = self.inner.consume(debit).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            outcome
        }
    }

    struct FailingStore;

    #[async_trait]
    impl CreditStore for FailingStore {
        async fn account(&self, _user_id: &str) -> Result<crate::models::CreditAccount, StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("down")))
        }

        async fn consume(&self, _debit: &DebitRequest) -> Result<ConsumeOutcome, StoreError> {
            Err(StoreError::Backend(anyhow::anyhow!("down")))
        }
    }

    fn ctx(user: &str, own_key: bool) -> DebitContext {
        DebitContext {
            request_id: "req-1".to_string(),
            user_id: user.to_string(),
            model: "gemini-2.5-flash".to_string(),
            model_class: ModelClass::Premium,
            using_own_key: own_key,
        }
    }

    fn broke_store() -> InMemoryCreditStore {
        InMemoryCreditStore::new().with_account(
            CreditAccount::new("broke", Tier::Free).with_balances(CreditBalances::default()),
        )
    }

    #[tokio::test]
    async fn commits_within_budget() {
        let guard = LedgerGuard::new(Arc::new(InMemoryCreditStore::new()), Duration::from_secs(10));
        let txn = guard.debit(&ctx("u1", false)).await.unwrap();
        assert_eq!(txn.outcome, DebitOutcome::Committed);
        assert!(!txn.using_own_key);
    }

    #[tokio::test]
    async fn explicit_denial_aborts() {
        let guard = LedgerGuard::new(Arc::new(broke_store()), Duration::from_secs(10));
        let err = guard.debit(&ctx("broke", false)).await.unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientCredits));
    }

    #[tokio::test]
    async fn own_key_is_never_denied() {
        let guard = LedgerGuard::new(Arc::new(broke_store()), Duration::from_secs(10));
        let txn = guard.debit(&ctx("broke", true)).await.unwrap();
        assert_eq!(txn.outcome, DebitOutcome::Committed);
    }

    #[tokio::test]
    async fn store_failure_is_a_processing_error() {
        let guard = LedgerGuard::new(Arc::new(FailingStore), Duration::from_secs(10));
        let err = guard.debit(&ctx("u1", false)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Processing(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_debit_times_out_and_continues() {
        let store = Arc::new(SlowStore {
            inner: InMemoryCreditStore::new(),
            delay: Duration::from_secs(12),
            finished: AtomicUsize::new(0),
        });
        let guard = LedgerGuard::new(store.clone(), Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        let txn = guard.debit(&ctx("u1", false)).await.unwrap();
        assert_eq!(txn.outcome, DebitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(12));

        // The abandoned debit still lands exactly once.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.finished.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.transaction_count(), 1);
        assert_eq!(store.inner.account("u1").await.unwrap().balances.premium, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn late_denial_does_not_fail_the_request() {
        let store = Arc::new(SlowStore {
            inner: broke_store(),
            delay: Duration::from_secs(12),
            finished: AtomicUsize::new(0),
        });
        let guard = LedgerGuard::new(store.clone(), Duration::from_secs(10));

        let txn = guard.debit(&ctx("broke", false)).await.unwrap();
        assert_eq!(txn.outcome, DebitOutcome::TimedOut);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.finished.load(Ordering::SeqCst), 1);
    }
}
