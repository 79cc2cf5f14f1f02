//! Subscription reconciliation.
//!
//! The provider's subscription record is the source of truth; the local
//! `Subscriber` row is a projection of it. `sync` re-fetches the provider
//! record, classifies it through one pure function, overwrites the whole
//! projection and re-allocates quota when the subscriber is entitled. No
//! other code path sets plan or quota size.

use clipflow_shared::{Plan, Subscriber, SubscriptionState};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::notify::CancellationNotifier;
use crate::provider::{ProviderCheckout, ProviderClient, ProviderSubscription};
use crate::quota::QuotaLedger;
use crate::store::{ProjectionWrite, QuotaStore};

/// What one provider snapshot means for the local projection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub plan: Plan,
    pub status: SubscriptionState,
    /// Whether the subscriber currently has paid access (and so gets a
    /// quota re-allocation)
    pub entitled: bool,
}

/// Result of a successful sync: the projection after the write, plus the raw
/// provider state it was derived from
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub subscriber: Subscriber,
    pub provider: ProviderSubscription,
    pub classification: Classification,
}

/// Subscription status read: local projection plus fresh provider state when
/// it could be fetched
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub subscriber: Subscriber,
    pub provider: Option<ProviderSubscription>,
}

/// Acknowledgement of a cancellation request
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancellationReceipt {
    pub message: String,
    /// When paid access ends, as far as the provider (or failing that, the
    /// local projection) knows
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_until: Option<OffsetDateTime>,
}

/// Classify a provider subscription snapshot, in priority order:
///
/// 1. active, no cancel scheduled: mapped tier, `active`, entitled
/// 2. active, cancel scheduled, billing date ahead: mapped tier,
///    `cancelling`, still entitled until the billing date
/// 3. active, cancel scheduled, billing date passed: grace over, free tier,
///    `expired`
/// 4. cancelled at the provider: free tier, `expired`
/// 5. anything else (past_due, paused, ...): free tier, status mirrored
///    verbatim, not entitled
///
/// An active subscription whose product id is not in the catalog is treated
/// as the lowest paid tier rather than failing the sync; the warning is the
/// only trace of the misconfiguration.
pub fn classify(
    subscription: &ProviderSubscription,
    config: &StripeConfig,
    now: OffsetDateTime,
) -> Classification {
    if subscription.is_active() {
        let plan = match subscription
            .product_id
            .as_deref()
            .and_then(|p| config.plan_for_product_id(p))
        {
            Some(plan) => plan,
            None => {
                tracing::warn!(
                    subscription_id = %subscription.id,
                    product_id = ?subscription.product_id,
                    "Unrecognized provider product id, defaulting to lowest paid tier"
                );
                Plan::lowest_paid()
            }
        };

        if !subscription.cancel_at_next_billing_date {
            return Classification {
                plan,
                status: SubscriptionState::Active,
                entitled: true,
            };
        }

        return match subscription.next_billing_date {
            Some(date) if date > now => Classification {
                plan,
                status: SubscriptionState::Cancelling,
                entitled: true,
            },
            _ => Classification {
                plan: Plan::Free,
                status: SubscriptionState::Expired,
                entitled: false,
            },
        };
    }

    if subscription.is_cancelled() {
        return Classification {
            plan: Plan::Free,
            status: SubscriptionState::Expired,
            entitled: false,
        };
    }

    Classification {
        plan: Plan::Free,
        status: SubscriptionState::Other(subscription.status.clone()),
        entitled: false,
    }
}

/// Reconciles provider subscription state into the local projection
#[derive(Clone)]
pub struct SubscriptionService {
    provider: Arc<dyn ProviderClient>,
    store: Arc<dyn QuotaStore>,
    ledger: QuotaLedger,
    config: StripeConfig,
    notifier: CancellationNotifier,
}

impl SubscriptionService {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        store: Arc<dyn QuotaStore>,
        ledger: QuotaLedger,
        config: StripeConfig,
        notifier: CancellationNotifier,
    ) -> Self {
        Self {
            provider,
            store,
            ledger,
            config,
            notifier,
        }
    }

    /// Open a hosted checkout session for a paid plan upgrade
    pub async fn create_checkout_session(
        &self,
        subscriber_id: Uuid,
        plan: Plan,
    ) -> BillingResult<ProviderCheckout> {
        if !plan.is_paid() {
            return Err(BillingError::InvalidPlan(format!(
                "{} is not a purchasable tier",
                plan
            )));
        }
        let subscriber = self.store.get(subscriber_id).await?;
        self.provider
            .create_checkout_session(&subscriber.email, plan)
            .await
    }

    /// Re-fetch the provider's subscription record and overwrite the local
    /// projection to match.
    ///
    /// Returns `Ok(None)` when the provider fetch fails or the email matches
    /// no subscriber; the caller decides whether that warrants a retry.
    /// Entitled classifications re-allocate quota with the provider's next
    /// billing date as the cycle end, so quota size always tracks the tier.
    pub async fn sync(
        &self,
        subscription_id: &str,
        email: &str,
    ) -> BillingResult<Option<SyncOutcome>> {
        let provider_sub = match self.provider.fetch_subscription(subscription_id).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Provider fetch failed, sync skipped"
                );
                return Ok(None);
            }
        };

        let Some(subscriber) = self.store.find_by_email(email).await? else {
            tracing::warn!(
                subscription_id = %subscription_id,
                email = %email,
                "No subscriber matches webhook email, sync skipped"
            );
            return Ok(None);
        };

        let classification = classify(&provider_sub, &self.config, OffsetDateTime::now_utc());
        let previous_plan = subscriber.current_plan();

        let projection = ProjectionWrite {
            plan: classification.plan,
            status: classification.status.clone(),
            // A free projection holds no subscription reference
            subscription_id: classification
                .entitled
                .then(|| provider_sub.id.clone()),
            next_billing_date: provider_sub.next_billing_date,
            cancel_at_billing_date: provider_sub.cancel_at_next_billing_date,
        };
        let mut updated = self.store.apply_projection(subscriber.id, projection).await?;

        if classification.entitled && classification.plan.is_paid() {
            self.ledger
                .allocate(
                    subscriber.id,
                    classification.plan,
                    provider_sub.next_billing_date,
                )
                .await?;
            updated = self.store.get(subscriber.id).await?;
        } else if previous_plan.is_paid() {
            // Downgrade settling: the free projection must carry the free
            // allocation, not the paid leftovers
            self.ledger
                .allocate(subscriber.id, Plan::Free, None)
                .await?;
            updated = self.store.get(subscriber.id).await?;
        }

        tracing::info!(
            subscriber_id = %subscriber.id,
            subscription_id = %subscription_id,
            plan = %classification.plan,
            status = %classification.status,
            entitled = classification.entitled,
            "Synced subscription"
        );

        Ok(Some(SyncOutcome {
            subscriber: updated,
            provider: provider_sub,
            classification,
        }))
    }

    /// Self-healing status read. A projection whose billing date has already
    /// passed is re-synced before answering; otherwise provider state is
    /// fetched fresh, never cached, since this read gates quota decisions.
    pub async fn get_status(&self, subscriber_id: Uuid) -> BillingResult<StatusSnapshot> {
        let subscriber = self.store.get(subscriber_id).await?;
        let Some(subscription_id) = subscriber.subscription_id.clone() else {
            return Ok(StatusSnapshot {
                subscriber,
                provider: None,
            });
        };

        let now = OffsetDateTime::now_utc();
        let stale = subscriber.next_billing_date.is_some_and(|d| d <= now);

        if stale {
            if let Some(outcome) = self.sync(&subscription_id, &subscriber.email).await? {
                return Ok(StatusSnapshot {
                    subscriber: outcome.subscriber,
                    provider: Some(outcome.provider),
                });
            }
            // Provider unreachable: answer from the projection we have
            return Ok(StatusSnapshot {
                subscriber,
                provider: None,
            });
        }

        let provider = match self.provider.fetch_subscription(&subscription_id).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(
                    subscriber_id = %subscriber_id,
                    error = %e,
                    "Provider fetch failed during status read"
                );
                None
            }
        };
        Ok(StatusSnapshot {
            subscriber,
            provider,
        })
    }

    /// Record the subscriber's wish to cancel and alert ops.
    ///
    /// The provider's cancel API is deliberately not called here; the
    /// subscription is cancelled manually at the provider, and the next sync
    /// overwrites the `cancellation_requested` marker with real state. The
    /// receipt tells the subscriber how long their paid access lasts.
    pub async fn request_cancellation(
        &self,
        subscriber_id: Uuid,
    ) -> BillingResult<CancellationReceipt> {
        let subscriber = self.store.get(subscriber_id).await?;
        let Some(subscription_id) = subscriber.subscription_id.clone() else {
            return Err(BillingError::NotFound(
                "No active subscription to cancel".to_string(),
            ));
        };

        // Best effort: enrich the notification with the provider's billing
        // date, falling back to the projection's copy
        let paid_until = match self.provider.fetch_subscription(&subscription_id).await {
            Ok(sub) => sub.next_billing_date,
            Err(e) => {
                tracing::warn!(
                    subscriber_id = %subscriber_id,
                    error = %e,
                    "Provider fetch failed for cancellation detail"
                );
                subscriber.next_billing_date
            }
        };

        self.store
            .set_status(subscriber_id, &SubscriptionState::CancellationRequested)
            .await?;

        tracing::info!(
            subscriber_id = %subscriber_id,
            subscription_id = %subscription_id,
            "Cancellation requested"
        );

        let notifier = self.notifier.clone();
        let email = subscriber.email.clone();
        tokio::spawn(async move {
            notifier
                .notify_cancellation_requested(&email, &subscription_id, paid_until)
                .await;
        });

        Ok(CancellationReceipt {
            message: "Cancellation request received. Your plan stays active until \
                      the end of the current billing period."
                .to_string(),
            paid_until,
        })
    }
}
