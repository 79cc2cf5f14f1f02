//! Quota store: durable subscriber state and webhook dedup claims.
//!
//! All mutation is expressed as single-row conditional updates (the atomic
//! decrement) or whole-row overwrites (allocation, projection sync). Nothing
//! here spans multiple subscribers in one transaction.

use async_trait::async_trait;
use clipflow_shared::{Plan, Subscriber, SubscriptionState};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Full overwrite of a subscriber's quota fields. This is allocation, not
/// top-up: the previous balances are intentionally discarded and the
/// secondary video counter restarts at zero.
#[derive(Debug, Clone)]
pub struct QuotaWrite {
    pub input_tokens_remaining: i64,
    pub output_tokens_remaining: i64,
    /// None only for rows that predate any allocation
    pub token_reset_date: Option<OffsetDateTime>,
    pub video_reset_date: Option<OffsetDateTime>,
}

/// Whole-row overwrite of the subscription projection. Written as one update
/// so concurrent syncs can interleave without leaving a row that mixes two
/// classifications (e.g. a paid plan with an expired status).
#[derive(Debug, Clone)]
pub struct ProjectionWrite {
    pub plan: Plan,
    pub status: SubscriptionState,
    pub subscription_id: Option<String>,
    pub next_billing_date: Option<OffsetDateTime>,
    pub cancel_at_billing_date: bool,
}

/// Outcome of the conditional decrement
#[derive(Debug, Clone, Copy)]
pub struct DecrementOutcome {
    pub success: bool,
    pub input_remaining: i64,
    pub output_remaining: i64,
}

/// Durable store for subscriber quota state and webhook dedup claims.
///
/// The Postgres implementation is the production store; an in-memory
/// implementation is provided for tests.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Fetch a subscriber by id
    async fn get(&self, subscriber_id: Uuid) -> BillingResult<Subscriber>;

    /// Fetch a subscriber by email (webhook identity key)
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Subscriber>>;

    /// Overwrite the subscriber's quota fields (allocation / cycle reset)
    async fn apply_quota(&self, subscriber_id: Uuid, write: QuotaWrite) -> BillingResult<()>;

    /// Overwrite the subscriber's subscription projection in one row write
    async fn apply_projection(
        &self,
        subscriber_id: Uuid,
        write: ProjectionWrite,
    ) -> BillingResult<Subscriber>;

    /// Set only the internal status marker (used for cancellation requests,
    /// which are overwritten by the next successful sync)
    async fn set_status(
        &self,
        subscriber_id: Uuid,
        status: &SubscriptionState,
    ) -> BillingResult<()>;

    /// Atomically decrement both token pools iff both balances are
    /// sufficient. Concurrent calls against the same subscriber serialize at
    /// the row; at most one succeeds when the combined request exceeds the
    /// remaining balance. Returns the post-operation balances either way.
    async fn decrement_if_sufficient(
        &self,
        subscriber_id: Uuid,
        input: i64,
        output: i64,
    ) -> BillingResult<DecrementOutcome>;

    /// Increment the secondary per-cycle unit counter, returning the new count
    async fn increment_videos(&self, subscriber_id: Uuid) -> BillingResult<i32>;

    /// Paid-tier subscribers whose token reset date has elapsed
    async fn find_due_for_reset(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscriber>>;

    /// Atomically claim a webhook delivery id for processing. Returns false
    /// when a live claim already exists (duplicate delivery); an expired
    /// claim may be re-claimed.
    async fn claim_delivery(
        &self,
        delivery_id: &str,
        expires_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Release a claim so the provider's retry can reprocess the delivery
    async fn release_delivery(&self, delivery_id: &str) -> BillingResult<()>;

    /// Remove dedup claims past their expiry, returning the number removed
    async fn purge_expired_deliveries(&self, now: OffsetDateTime) -> BillingResult<u64>;
}

/// Postgres-backed quota store
#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn get(&self, subscriber_id: Uuid) -> BillingResult<Subscriber> {
        let subscriber: Option<Subscriber> =
            sqlx::query_as("SELECT * FROM subscribers WHERE id = $1")
                .bind(subscriber_id)
                .fetch_optional(&self.pool)
                .await?;

        subscriber
            .ok_or_else(|| BillingError::NotFound(format!("Subscriber {} not found", subscriber_id)))
    }

    async fn find_by_email(&self, email: &str) -> BillingResult<Option<Subscriber>> {
        let subscriber: Option<Subscriber> =
            sqlx::query_as("SELECT * FROM subscribers WHERE email = $1")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(subscriber)
    }

    async fn apply_quota(&self, subscriber_id: Uuid, write: QuotaWrite) -> BillingResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE subscribers
            SET input_tokens_remaining = $2,
                output_tokens_remaining = $3,
                token_reset_date = $4,
                videos_processed_this_month = 0,
                video_reset_date = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscriber_id)
        .bind(write.input_tokens_remaining)
        .bind(write.output_tokens_remaining)
        .bind(write.token_reset_date)
        .bind(write.video_reset_date)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Subscriber {} not found",
                subscriber_id
            )));
        }
        Ok(())
    }

    async fn apply_projection(
        &self,
        subscriber_id: Uuid,
        write: ProjectionWrite,
    ) -> BillingResult<Subscriber> {
        let subscriber: Option<Subscriber> = sqlx::query_as(
            r#"
            UPDATE subscribers
            SET plan = $2,
                subscription_status = $3,
                subscription_id = $4,
                next_billing_date = $5,
                cancel_at_billing_date = $6,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscriber_id)
        .bind(write.plan.to_string())
        .bind(write.status.as_str())
        .bind(&write.subscription_id)
        .bind(write.next_billing_date)
        .bind(write.cancel_at_billing_date)
        .fetch_optional(&self.pool)
        .await?;

        subscriber
            .ok_or_else(|| BillingError::NotFound(format!("Subscriber {} not found", subscriber_id)))
    }

    async fn set_status(
        &self,
        subscriber_id: Uuid,
        status: &SubscriptionState,
    ) -> BillingResult<()> {
        let updated = sqlx::query(
            "UPDATE subscribers SET subscription_status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(subscriber_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Subscriber {} not found",
                subscriber_id
            )));
        }
        Ok(())
    }

    async fn decrement_if_sufficient(
        &self,
        subscriber_id: Uuid,
        input: i64,
        output: i64,
    ) -> BillingResult<DecrementOutcome> {
        // The WHERE clause is the invariant: the row never goes negative, and
        // two concurrent decrements serialize on the row lock.
        let decremented: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE subscribers
            SET input_tokens_remaining = input_tokens_remaining - $2,
                output_tokens_remaining = output_tokens_remaining - $3,
                updated_at = NOW()
            WHERE id = $1
              AND input_tokens_remaining >= $2
              AND output_tokens_remaining >= $3
            RETURNING input_tokens_remaining, output_tokens_remaining
            "#,
        )
        .bind(subscriber_id)
        .bind(input)
        .bind(output)
        .fetch_optional(&self.pool)
        .await?;

        match decremented {
            Some((input_remaining, output_remaining)) => Ok(DecrementOutcome {
                success: true,
                input_remaining,
                output_remaining,
            }),
            None => {
                // Re-read so the caller can report required vs. available
                let subscriber = self.get(subscriber_id).await?;
                Ok(DecrementOutcome {
                    success: false,
                    input_remaining: subscriber.input_tokens_remaining,
                    output_remaining: subscriber.output_tokens_remaining,
                })
            }
        }
    }

    async fn increment_videos(&self, subscriber_id: Uuid) -> BillingResult<i32> {
        let count: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE subscribers
            SET videos_processed_this_month = videos_processed_this_month + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING videos_processed_this_month
            "#,
        )
        .bind(subscriber_id)
        .fetch_optional(&self.pool)
        .await?;

        count
            .map(|(c,)| c)
            .ok_or_else(|| BillingError::NotFound(format!("Subscriber {} not found", subscriber_id)))
    }

    async fn find_due_for_reset(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscriber>> {
        let due: Vec<Subscriber> = sqlx::query_as(
            r#"
            SELECT * FROM subscribers
            WHERE plan <> 'free'
              AND token_reset_date IS NOT NULL
              AND token_reset_date <= $1
            ORDER BY token_reset_date ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(due)
    }

    async fn claim_delivery(
        &self,
        delivery_id: &str,
        expires_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        // INSERT..ON CONFLICT..RETURNING claims exclusive processing rights
        // atomically; only an expired claim can be taken over.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_deliveries (delivery_id, received_at, expires_at)
            VALUES ($1, NOW(), $2)
            ON CONFLICT (delivery_id) DO UPDATE
                SET received_at = NOW(), expires_at = EXCLUDED.expires_at
                WHERE webhook_deliveries.expires_at <= NOW()
            RETURNING delivery_id
            "#,
        )
        .bind(delivery_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn release_delivery(&self, delivery_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM webhook_deliveries WHERE delivery_id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired_deliveries(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM webhook_deliveries WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory quota store for testing.
#[cfg(any(test, feature = "test-store"))]
pub mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct InMemoryInner {
        subscribers: Mutex<HashMap<Uuid, Subscriber>>,
        deliveries: Mutex<HashMap<String, OffsetDateTime>>,
    }

    /// In-memory quota store. Wraps data in Arc for cheap cloning; the
    /// subscriber map mutex stands in for row-level atomicity.
    #[derive(Default, Clone)]
    pub struct InMemoryQuotaStore {
        inner: Arc<InMemoryInner>,
    }

    impl InMemoryQuotaStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert or replace a subscriber row
        pub fn seed(&self, subscriber: Subscriber) {
            let mut subs = self.inner.subscribers.lock().unwrap();
            subs.insert(subscriber.id, subscriber);
        }

        /// Snapshot of a subscriber row (for assertions)
        pub fn snapshot(&self, subscriber_id: Uuid) -> Option<Subscriber> {
            self.inner.subscribers.lock().unwrap().get(&subscriber_id).cloned()
        }

        /// Currently-live dedup claims (for assertions)
        pub fn claimed_deliveries(&self) -> Vec<String> {
            self.inner.deliveries.lock().unwrap().keys().cloned().collect()
        }
    }

    /// Build a subscriber row with FREE defaults, as account creation would
    pub fn new_free_subscriber(email: &str) -> Subscriber {
        let now = OffsetDateTime::now_utc();
        let limits = Plan::Free.limits();
        Subscriber {
            id: Uuid::new_v4(),
            email: email.to_string(),
            plan: Plan::Free.to_string(),
            input_tokens_remaining: limits.input_tokens,
            output_tokens_remaining: limits.output_tokens,
            token_reset_date: None,
            subscription_id: None,
            subscription_status: SubscriptionState::Free.as_str().to_string(),
            next_billing_date: None,
            cancel_at_billing_date: false,
            videos_processed_this_month: 0,
            video_reset_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[async_trait]
    impl QuotaStore for InMemoryQuotaStore {
        async fn get(&self, subscriber_id: Uuid) -> BillingResult<Subscriber> {
            self.inner
                .subscribers
                .lock()
                .unwrap()
                .get(&subscriber_id)
                .cloned()
                .ok_or_else(|| {
                    BillingError::NotFound(format!("Subscriber {} not found", subscriber_id))
                })
        }

        async fn find_by_email(&self, email: &str) -> BillingResult<Option<Subscriber>> {
            Ok(self
                .inner
                .subscribers
                .lock()
                .unwrap()
                .values()
                .find(|s| s.email == email)
                .cloned())
        }

        async fn apply_quota(&self, subscriber_id: Uuid, write: QuotaWrite) -> BillingResult<()> {
            let mut subs = self.inner.subscribers.lock().unwrap();
            let subscriber = subs.get_mut(&subscriber_id).ok_or_else(|| {
                BillingError::NotFound(format!("Subscriber {} not found", subscriber_id))
            })?;
            subscriber.input_tokens_remaining = write.input_tokens_remaining;
            subscriber.output_tokens_remaining = write.output_tokens_remaining;
            subscriber.token_reset_date = write.token_reset_date;
            subscriber.videos_processed_this_month = 0;
            subscriber.video_reset_date = write.video_reset_date;
            subscriber.updated_at = OffsetDateTime::now_utc();
            Ok(())
        }

        async fn apply_projection(
            &self,
            subscriber_id: Uuid,
            write: ProjectionWrite,
        ) -> BillingResult<Subscriber> {
            let mut subs = self.inner.subscribers.lock().unwrap();
            let subscriber = subs.get_mut(&subscriber_id).ok_or_else(|| {
                BillingError::NotFound(format!("Subscriber {} not found", subscriber_id))
            })?;
            subscriber.plan = write.plan.to_string();
            subscriber.subscription_status = write.status.as_str().to_string();
            subscriber.subscription_id = write.subscription_id;
            subscriber.next_billing_date = write.next_billing_date;
            subscriber.cancel_at_billing_date = write.cancel_at_billing_date;
            subscriber.updated_at = OffsetDateTime::now_utc();
            Ok(subscriber.clone())
        }

        async fn set_status(
            &self,
            subscriber_id: Uuid,
            status: &SubscriptionState,
        ) -> BillingResult<()> {
            let mut subs = self.inner.subscribers.lock().unwrap();
            let subscriber = subs.get_mut(&subscriber_id).ok_or_else(|| {
                BillingError::NotFound(format!("Subscriber {} not found", subscriber_id))
            })?;
            subscriber.subscription_status = status.as_str().to_string();
            subscriber.updated_at = OffsetDateTime::now_utc();
            Ok(())
        }

        async fn decrement_if_sufficient(
            &self,
            subscriber_id: Uuid,
            input: i64,
            output: i64,
        ) -> BillingResult<DecrementOutcome> {
            // Single lock covers check and decrement: same atomicity the
            // conditional UPDATE gives the Postgres store.
            let mut subs = self.inner.subscribers.lock().unwrap();
            let subscriber = subs.get_mut(&subscriber_id).ok_or_else(|| {
                BillingError::NotFound(format!("Subscriber {} not found", subscriber_id))
            })?;

            if subscriber.input_tokens_remaining >= input
                && subscriber.output_tokens_remaining >= output
            {
                subscriber.input_tokens_remaining -= input;
                subscriber.output_tokens_remaining -= output;
                subscriber.updated_at = OffsetDateTime::now_utc();
                Ok(DecrementOutcome {
                    success: true,
                    input_remaining: subscriber.input_tokens_remaining,
                    output_remaining: subscriber.output_tokens_remaining,
                })
            } else {
                Ok(DecrementOutcome {
                    success: false,
                    input_remaining: subscriber.input_tokens_remaining,
                    output_remaining: subscriber.output_tokens_remaining,
                })
            }
        }

        async fn increment_videos(&self, subscriber_id: Uuid) -> BillingResult<i32> {
            let mut subs = self.inner.subscribers.lock().unwrap();
            let subscriber = subs.get_mut(&subscriber_id).ok_or_else(|| {
                BillingError::NotFound(format!("Subscriber {} not found", subscriber_id))
            })?;
            subscriber.videos_processed_this_month += 1;
            subscriber.updated_at = OffsetDateTime::now_utc();
            Ok(subscriber.videos_processed_this_month)
        }

        async fn find_due_for_reset(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscriber>> {
            Ok(self
                .inner
                .subscribers
                .lock()
                .unwrap()
                .values()
                .filter(|s| s.current_plan().is_paid() && s.cycle_elapsed(now))
                .cloned()
                .collect())
        }

        async fn claim_delivery(
            &self,
            delivery_id: &str,
            expires_at: OffsetDateTime,
        ) -> BillingResult<bool> {
            let mut deliveries = self.inner.deliveries.lock().unwrap();
            let now = OffsetDateTime::now_utc();
            match deliveries.get(delivery_id) {
                Some(existing_expiry) if *existing_expiry > now => Ok(false),
                _ => {
                    deliveries.insert(delivery_id.to_string(), expires_at);
                    Ok(true)
                }
            }
        }

        async fn release_delivery(&self, delivery_id: &str) -> BillingResult<()> {
            self.inner.deliveries.lock().unwrap().remove(delivery_id);
            Ok(())
        }

        async fn purge_expired_deliveries(&self, now: OffsetDateTime) -> BillingResult<u64> {
            let mut deliveries = self.inner.deliveries.lock().unwrap();
            let before = deliveries.len();
            deliveries.retain(|_, expiry| *expiry > now);
            Ok((before - deliveries.len()) as u64)
        }
    }
}
