//! Webhook intake with persisted deduplication.
//!
//! Signature verification happens upstream; this handler receives parsed
//! events and guarantees at-most-once sync per delivery id across restarts
//! and instances. The provider's retry is the only retry mechanism: a failed
//! sync releases the dedup claim so the redelivery can be processed.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::store::QuotaStore;
use crate::subscriptions::SubscriptionService;

/// How long a processed delivery id blocks replays. Matches the provider's
/// retry horizon.
const DEDUP_WINDOW: Duration = Duration::hours(24);

/// Parsed webhook event, post signature verification
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub event_type: String,
    pub delivery_id: String,
    pub payload: Value,
}

impl WebhookEvent {
    /// Actionable identity, when the event type carries one
    fn identity(&self) -> Option<(&str, &str)> {
        let subscription_id = self.payload.get("subscription_id")?.as_str()?;
        let email = self.payload.get("customer_email")?.as_str()?;
        Some((subscription_id, email))
    }
}

/// Webhook event processor
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn QuotaStore>,
    subscriptions: SubscriptionService,
}

impl WebhookHandler {
    pub fn new(store: Arc<dyn QuotaStore>, subscriptions: SubscriptionService) -> Self {
        Self {
            store,
            subscriptions,
        }
    }

    /// Process one delivery. Duplicates and identity-less events are no-op
    /// successes; a failed sync surfaces an error AND releases the claim so
    /// the provider's redelivery gets a clean attempt.
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let claimed = self
            .store
            .claim_delivery(&event.delivery_id, now + DEDUP_WINDOW)
            .await?;

        if !claimed {
            tracing::info!(
                delivery_id = %event.delivery_id,
                event_type = %event.event_type,
                "Duplicate webhook delivery, skipping"
            );
            return Ok(());
        }

        let Some((subscription_id, email)) = event.identity() else {
            // Some event types carry no subscription identity; the claim
            // stays so replays of the same no-op are also skipped
            tracing::debug!(
                delivery_id = %event.delivery_id,
                event_type = %event.event_type,
                "Webhook event carries no actionable identity"
            );
            return Ok(());
        };

        // An email with no matching subscriber is a permanent condition, not
        // a transient failure: keep the claim so the provider stops retrying
        if self.store.find_by_email(email).await?.is_none() {
            tracing::warn!(
                delivery_id = %event.delivery_id,
                subscription_id = %subscription_id,
                email = %email,
                "Webhook email matches no subscriber, dropping event"
            );
            return Ok(());
        }

        match self.subscriptions.sync(subscription_id, email).await {
            Ok(Some(outcome)) => {
                tracing::info!(
                    delivery_id = %event.delivery_id,
                    event_type = %event.event_type,
                    subscription_id = %subscription_id,
                    plan = %outcome.classification.plan,
                    "Webhook processed"
                );
                Ok(())
            }
            Ok(None) => {
                self.store.release_delivery(&event.delivery_id).await?;
                Err(BillingError::ProviderUnavailable {
                    status_code: None,
                    message: format!(
                        "Sync could not complete for subscription {}",
                        subscription_id
                    ),
                })
            }
            Err(e) => {
                self.store.release_delivery(&event.delivery_id).await?;
                Err(e)
            }
        }
    }

    /// Drop dedup claims past their expiry; called by the worker sweep
    pub async fn purge_expired(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let purged = self.store.purge_expired_deliveries(now).await?;
        if purged > 0 {
            tracing::info!(purged = purged, "Purged expired webhook dedup claims");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CatalogIds, StripeConfig};
    use crate::notify::CancellationNotifier;
    use crate::provider::test::{active_subscription, MockProvider};
    use crate::quota::QuotaLedger;
    use crate::store::test::{new_free_subscriber, InMemoryQuotaStore};
    use clipflow_shared::Plan;
    use serde_json::json;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            catalog: CatalogIds {
                creator_price: "price_creator".to_string(),
                studio_price: "price_studio".to_string(),
                creator_product: "prod_creator".to_string(),
                studio_product: "prod_studio".to_string(),
            },
            app_base_url: "https://app.clipflow.test".to_string(),
        }
    }

    fn handler(provider: MockProvider, store: InMemoryQuotaStore) -> WebhookHandler {
        let store: Arc<dyn QuotaStore> = Arc::new(store);
        let subscriptions = SubscriptionService::new(
            Arc::new(provider),
            store.clone(),
            QuotaLedger::new(store.clone()),
            test_config(),
            CancellationNotifier::new(None),
        );
        WebhookHandler::new(store, subscriptions)
    }

    fn upgrade_event(delivery_id: &str, email: &str) -> WebhookEvent {
        WebhookEvent {
            event_type: "customer.subscription.updated".to_string(),
            delivery_id: delivery_id.to_string(),
            payload: json!({
                "subscription_id": "sub_hook",
                "customer_email": email,
            }),
        }
    }

    #[tokio::test]
    async fn test_replayed_delivery_syncs_exactly_once() {
        let provider = MockProvider::new();
        let store = InMemoryQuotaStore::new();
        store.seed(new_free_subscriber("hook@example.com"));
        provider.insert(active_subscription(
            "sub_hook",
            "prod_creator",
            "hook@example.com",
        ));

        let handler = handler(provider.clone(), store);
        let event = upgrade_event("evt_replay", "hook@example.com");

        handler.handle_event(&event).await.unwrap();
        handler.handle_event(&event).await.unwrap();

        assert_eq!(provider.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_webhook_reallocates_quota() {
        let provider = MockProvider::new();
        let store = InMemoryQuotaStore::new();
        let subscriber = new_free_subscriber("hook@example.com");
        let id = subscriber.id;
        store.seed(subscriber);
        provider.insert(active_subscription(
            "sub_hook",
            "prod_creator",
            "hook@example.com",
        ));

        let handler = handler(provider, store.clone());
        handler
            .handle_event(&upgrade_event("evt_up", "hook@example.com"))
            .await
            .unwrap();

        let row = store.snapshot(id).unwrap();
        assert_eq!(row.current_plan(), Plan::Creator);
        assert_eq!(row.input_tokens_remaining, 3_000_000);
    }

    #[tokio::test]
    async fn test_event_without_identity_is_noop_success() {
        let provider = MockProvider::new();
        let store = InMemoryQuotaStore::new();
        let handler = handler(provider.clone(), store.clone());

        let event = WebhookEvent {
            event_type: "invoice.finalized".to_string(),
            delivery_id: "evt_noid".to_string(),
            payload: json!({ "amount_due": 999 }),
        };

        handler.handle_event(&event).await.unwrap();
        assert_eq!(provider.fetch_count(), 0);
        // The claim is kept so a replay stays a no-op
        assert!(store
            .claimed_deliveries()
            .contains(&"evt_noid".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_email_is_dropped_not_retried() {
        let provider = MockProvider::new();
        let store = InMemoryQuotaStore::new();
        provider.insert(active_subscription(
            "sub_hook",
            "prod_creator",
            "ghost@example.com",
        ));

        let handler = handler(provider.clone(), store.clone());
        let event = upgrade_event("evt_ghost", "ghost@example.com");

        // No subscriber row exists for this email: success, claim kept, so
        // the provider's redelivery is also a no-op
        handler.handle_event(&event).await.unwrap();
        assert!(store
            .claimed_deliveries()
            .contains(&"evt_ghost".to_string()));
        assert_eq!(provider.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_sync_releases_claim_for_retry() {
        let provider = MockProvider::new();
        let store = InMemoryQuotaStore::new();
        store.seed(new_free_subscriber("hook@example.com"));
        provider.insert(active_subscription(
            "sub_hook",
            "prod_creator",
            "hook@example.com",
        ));

        let handler = handler(provider.clone(), store.clone());
        let event = upgrade_event("evt_retry", "hook@example.com");

        provider.fail_fetches(true);
        let err = handler.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, BillingError::ProviderUnavailable { .. }));
        assert!(store.claimed_deliveries().is_empty());

        // The provider's redelivery now succeeds
        provider.fail_fetches(false);
        handler.handle_event(&event).await.unwrap();
    }
}
