//! Payment provider access behind a trait seam.
//!
//! `ProviderClient` exposes the two calls the reconciler actually makes:
//! fetching a subscription's current truth and opening a checkout session.
//! There is deliberately no cancel call here; cancellation is recorded
//! locally and settled out of band (see `SubscriptionService`).

use async_trait::async_trait;
use clipflow_shared::Plan;
use std::collections::HashMap;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    Subscription,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Provider-agnostic snapshot of one subscription, as of the fetch
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    /// Provider status string, verbatim ("active", "canceled", "past_due", ...)
    pub status: String,
    /// Product id of the first line item, when present
    pub product_id: Option<String>,
    pub cancel_at_next_billing_date: bool,
    pub next_billing_date: Option<OffsetDateTime>,
    pub customer_email: Option<String>,
}

impl ProviderSubscription {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == "canceled" || self.status == "cancelled"
    }
}

/// Newly created checkout session
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderCheckout {
    pub session_id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Fetch the current state of a subscription from the provider
    async fn fetch_subscription(&self, subscription_id: &str)
        -> BillingResult<ProviderSubscription>;

    /// Open a hosted checkout session for a paid plan
    async fn create_checkout_session(
        &self,
        email: &str,
        plan: Plan,
    ) -> BillingResult<ProviderCheckout>;
}

/// Stripe-backed provider client
#[derive(Clone)]
pub struct StripeProvider {
    stripe: StripeClient,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

#[async_trait]
impl ProviderClient for StripeProvider {
    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Internal(format!("Invalid subscription ID: {}", e)))?;

        let subscription = Subscription::retrieve(
            self.stripe.inner(),
            &sub_id,
            &["customer", "items.data.price.product"],
        )
        .await?;

        let product_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| price.product.as_ref())
            .map(|product| match product {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(p) => p.id.to_string(),
            });

        let customer_email = match &subscription.customer {
            stripe::Expandable::Object(customer) => customer.email.clone(),
            stripe::Expandable::Id(_) => None,
        };

        let next_billing_date = OffsetDateTime::from_unix_timestamp(
            subscription.current_period_end,
        )
        .ok();

        Ok(ProviderSubscription {
            id: subscription.id.to_string(),
            status: subscription.status.as_str().to_string(),
            product_id,
            cancel_at_next_billing_date: subscription.cancel_at_period_end,
            next_billing_date,
            customer_email,
        })
    }

    async fn create_checkout_session(
        &self,
        email: &str,
        plan: Plan,
    ) -> BillingResult<ProviderCheckout> {
        let price_id = self
            .stripe
            .config()
            .price_id_for_plan(plan)
            .ok_or_else(|| {
                BillingError::Config(format!("No checkout price configured for plan {}", plan))
            })?
            .to_string();

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = HashMap::new();
        metadata.insert("plan".to_string(), plan.to_string());
        metadata.insert("email".to_string(), email.to_string());

        let params = CreateCheckoutSession {
            customer_email: Some(email),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            allow_promotion_codes: Some(true),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            email = %email,
            session_id = %session.id,
            plan = %plan,
            "Created checkout session"
        );

        Ok(ProviderCheckout {
            session_id: session.id.to_string(),
            url: session.url,
        })
    }
}

/// Scriptable provider for testing.
#[cfg(any(test, feature = "test-store"))]
pub mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Mock provider returning canned responses and counting calls
    #[derive(Default, Clone)]
    pub struct MockProvider {
        subscriptions: Arc<Mutex<HashMap<String, ProviderSubscription>>>,
        fail_fetches: Arc<Mutex<bool>>,
        fetch_calls: Arc<AtomicUsize>,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, subscription: ProviderSubscription) {
            self.subscriptions
                .lock()
                .unwrap()
                .insert(subscription.id.clone(), subscription);
        }

        /// Make every subsequent fetch fail with a provider error
        pub fn fail_fetches(&self, fail: bool) {
            *self.fail_fetches.lock().unwrap() = fail;
        }

        pub fn fetch_count(&self) -> usize {
            self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for MockProvider {
        async fn fetch_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<ProviderSubscription> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail_fetches.lock().unwrap() {
                return Err(BillingError::ProviderUnavailable {
                    status_code: Some(503),
                    message: "mock outage".to_string(),
                });
            }
            self.subscriptions
                .lock()
                .unwrap()
                .get(subscription_id)
                .cloned()
                .ok_or_else(|| BillingError::ProviderUnavailable {
                    status_code: Some(404),
                    message: format!("no such subscription: {}", subscription_id),
                })
        }

        async fn create_checkout_session(
            &self,
            email: &str,
            _plan: Plan,
        ) -> BillingResult<ProviderCheckout> {
            Ok(ProviderCheckout {
                session_id: format!("cs_test_{}", email.replace('@', "_")),
                url: Some("https://checkout.test/session".to_string()),
            })
        }
    }

    /// Canned active subscription for tests
    pub fn active_subscription(id: &str, product_id: &str, email: &str) -> ProviderSubscription {
        ProviderSubscription {
            id: id.to_string(),
            status: "active".to_string(),
            product_id: Some(product_id.to_string()),
            cancel_at_next_billing_date: false,
            next_billing_date: Some(OffsetDateTime::now_utc() + time::Duration::days(30)),
            customer_email: Some(email.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_helpers() {
        let mut sub = test::active_subscription("sub_1", "prod_creator", "a@b.c");
        assert!(sub.is_active());
        assert!(!sub.is_cancelled());

        sub.status = "canceled".to_string();
        assert!(sub.is_cancelled());

        // Both provider spellings are accepted
        sub.status = "cancelled".to_string();
        assert!(sub.is_cancelled());
    }
}
