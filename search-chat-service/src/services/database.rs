//! MongoDB-backed credit ledger, preference store and guest quota.
//!
//! Balances are decremented with a single conditional `$inc` so two requests
//! from the same user cannot both spend the last credit. Transactions carry a
//! unique index on `transaction_id`, which makes `consume` idempotent.
//! Guest usage relies on the unique `anonymous_id` index the same way: an
//! exhausted counter fails its filter, the upsert collides, and the request
//! is refused.

use crate::models::{CreditAccount, CreditBalances, Tier};
use crate::services::stores::{
    ConsumeOutcome, CreditStore, DebitRequest, GuestQuotaStore, PreferenceStore, QuotaDecision,
    SearchPreferences, StoreError,
};
use async_trait::async_trait;
use mongodb::{
    bson::{self, doc, DateTime as BsonDateTime, Document},
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument, UpdateOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

const DUPLICATE_KEY: i32 = 11000;

#[derive(Clone)]
pub struct ChatDb {
    client: MongoClient,
    db: Database,
}

fn backend_error(context: &str, e: impl std::fmt::Display) -> StoreError {
    tracing::error!("{}: {}", context, e);
    StoreError::Backend(anyhow::anyhow!("{}: {}", context, e))
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        *e.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == DUPLICATE_KEY
    )
}

impl ChatDb {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Connected to MongoDB");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for search-chat-service");

        let indexes = [
            (self.accounts(), "user_id", "account_user_idx"),
            (self.transactions(), "transaction_id", "transaction_id_idx"),
            (self.preferences(), "user_id", "preferences_user_idx"),
            (self.guest_usage(), "anonymous_id", "guest_anonymous_idx"),
        ];

        for (collection, field, name) in indexes {
            let index = IndexModel::builder()
                .keys(doc! { field: 1 })
                .options(
                    IndexOptions::builder()
                        .name(name.to_string())
                        .unique(true)
                        .build(),
                )
                .build();

            collection.create_index(index, None).await.map_err(|e| {
                tracing::error!("Failed to create {} index: {}", name, e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        }

        tracing::info!("Created MongoDB indexes");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    fn accounts(&self) -> Collection<Document> {
        self.db.collection("credit_accounts")
    }

    fn transactions(&self) -> Collection<Document> {
        self.db.collection("credit_transactions")
    }

    fn preferences(&self) -> Collection<Document> {
        self.db.collection("user_preferences")
    }

    fn guest_usage(&self) -> Collection<Document> {
        self.db.collection("guest_usage")
    }

    /// Create the account with its tier allowance if it does not exist yet.
    async fn ensure_account(&self, user_id: &str) -> Result<(), StoreError> {
        let balances = bson::to_bson(&CreditBalances::allowance_for(Tier::Free))
            .map_err(|e| backend_error("Failed to encode balances", e))?;

        self.accounts()
            .update_one(
                doc! { "user_id": user_id },
                doc! {
                    "$setOnInsert": {
                        "user_id": user_id,
                        "tier": "free",
                        "balances": balances,
                        "created_at": BsonDateTime::now(),
                    }
                },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(|e| backend_error("Failed to provision account", e))?;
        Ok(())
    }

    async fn record_transaction(&self, debit: &DebitRequest) -> Result<bool, StoreError> {
        let record = doc! {
            "transaction_id": &debit.transaction_id,
            "user_id": &debit.user_id,
            "model": &debit.model,
            "model_class": debit.model_class.as_str(),
            "using_own_key": debit.using_own_key,
            "status": "pending",
            "attempted_at": BsonDateTime::now(),
        };

        match self.transactions().insert_one(record, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(backend_error("Failed to record transaction", e)),
        }
    }

    async fn settle_transaction(&self, transaction_id: &str, outcome: ConsumeOutcome) {
        let status = match outcome {
            ConsumeOutcome::Applied => "applied",
            ConsumeOutcome::Insufficient => "insufficient",
            ConsumeOutcome::Duplicate => return,
        };

        if let Err(e) = self
            .transactions()
            .update_one(
                doc! { "transaction_id": transaction_id },
                doc! { "$set": { "status": status, "settled_at": BsonDateTime::now() } },
                None,
            )
            .await
        {
            tracing::warn!(transaction_id = %transaction_id, error = %e, "Failed to settle transaction");
        }
    }

    async fn apply_debit(&self, debit: &DebitRequest) -> Result<ConsumeOutcome, StoreError> {
        if debit.using_own_key {
            return Ok(ConsumeOutcome::Applied);
        }
        self.ensure_account(&debit.user_id).await?;

        let field = format!("balances.{}", debit.model_class.as_str());
        let decremented = self
            .accounts()
            .find_one_and_update(
                doc! {
                    "user_id": &debit.user_id,
                    "tier": { "$ne": "admin" },
                    &field: { "$gt": 0 },
                },
                doc! { "$inc": { &field: -1_i64 } },
                None,
            )
            .await
            .map_err(|e| backend_error("Failed to debit account", e))?;

        if decremented.is_some() || self.account(&debit.user_id).await?.tier == Tier::Admin {
            Ok(ConsumeOutcome::Applied)
        } else {
            Ok(ConsumeOutcome::Insufficient)
        }
    }

    /// Drop a still-pending transaction so the same id can be retried.
    async fn release_transaction(&self, transaction_id: &str) {
        if let Err(e) = self
            .transactions()
            .delete_one(doc! { "transaction_id": transaction_id, "status": "pending" }, None)
            .await
        {
            tracing::warn!(transaction_id = %transaction_id, error = %e, "Failed to release transaction");
        }
    }
}

#[async_trait]
impl CreditStore for ChatDb {
    async fn account(&self, user_id: &str) -> Result<CreditAccount, StoreError> {
        let found = self
            .accounts()
            .find_one(doc! { "user_id": user_id }, None)
            .await
            .map_err(|e| backend_error("Failed to load account", e))?;

        match found {
            Some(document) => bson::from_document(document)
                .map_err(|e| backend_error("Failed to decode account", e)),
            None => Ok(CreditAccount::new(user_id, Tier::Free)),
        }
    }

    async fn consume(&self, debit: &DebitRequest) -> Result<ConsumeOutcome, StoreError> {
        if !self.record_transaction(debit).await? {
            return Ok(ConsumeOutcome::Duplicate);
        }

        match self.apply_debit(debit).await {
            Ok(outcome) => {
                self.settle_transaction(&debit.transaction_id, outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                // A failed debit must not look applied when the id is replayed.
                self.release_transaction(&debit.transaction_id).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl PreferenceStore for ChatDb {
    async fn search_preferences(&self, user_id: &str) -> Result<SearchPreferences, StoreError> {
        let found = self
            .preferences()
            .find_one(doc! { "user_id": user_id }, None)
            .await
            .map_err(|e| backend_error("Failed to load preferences", e))?;

        match found {
            Some(document) => bson::from_document(document)
                .map_err(|e| backend_error("Failed to decode preferences", e)),
            None => Ok(SearchPreferences::default()),
        }
    }
}

fn used_count(document: &Document) -> u32 {
    document
        .get_i64("used")
        .ok()
        .or_else(|| document.get_i32("used").ok().map(i64::from))
        .unwrap_or(0)
        .max(0) as u32
}

#[async_trait]
impl GuestQuotaStore for ChatDb {
    async fn try_consume(&self, anonymous_id: &str, limit: u32) -> Result<QuotaDecision, StoreError> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let updated = self
            .guest_usage()
            .find_one_and_update(
                doc! { "anonymous_id": anonymous_id, "used": { "$lt": limit as i64 } },
                doc! {
                    "$inc": { "used": 1_i64 },
                    "$set": { "last_seen_at": BsonDateTime::now() },
                },
                options,
            )
            .await;

        match updated {
            Ok(Some(document)) => Ok(QuotaDecision {
                allowed: true,
                used: used_count(&document),
            }),
            Ok(None) => Ok(QuotaDecision {
                allowed: true,
                used: 1,
            }),
            Err(e) if is_duplicate_key(&e) => {
                let used = self
                    .guest_usage()
                    .find_one(doc! { "anonymous_id": anonymous_id }, None)
                    .await
                    .map_err(|e| backend_error("Failed to load guest usage", e))?
                    .map(|d| used_count(&d))
                    .unwrap_or(limit);
                Ok(QuotaDecision {
                    allowed: false,
                    used,
                })
            }
            Err(e) => Err(backend_error("Failed to update guest usage", e)),
        }
    }
}
