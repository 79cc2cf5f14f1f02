// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries quota shortfall detail
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! clipflow billing
//!
//! Quota ledger plus subscription reconciliation against Stripe.
//!
//! - **Quota Ledger**: per-cycle input/output token pools with atomic
//!   consumption and lazy cycle reset
//! - **Subscription Reconciler**: provider state is the source of truth;
//!   webhooks and self-healing reads overwrite the local projection
//! - **Webhooks**: persisted dedup claims, at-most-once sync per delivery
//! - **Checkout**: hosted checkout session creation for paid tiers
//! - **Cancellation**: recorded locally and routed to ops, never sent to the
//!   provider's cancel API

pub mod client;
pub mod error;
pub mod notify;
pub mod provider;
pub mod quota;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

pub use client::{CatalogIds, StripeClient, StripeConfig};
pub use error::{BillingError, BillingResult};
pub use notify::CancellationNotifier;
pub use provider::{ProviderCheckout, ProviderClient, ProviderSubscription, StripeProvider};
pub use quota::{estimate_usage, QuotaLedger, ResetSweep, TokenStatus, UsageEstimate};
pub use store::{DecrementOutcome, PgQuotaStore, ProjectionWrite, QuotaStore, QuotaWrite};
pub use subscriptions::{
    classify, CancellationReceipt, Classification, StatusSnapshot, SubscriptionService,
    SyncOutcome,
};
pub use webhooks::{WebhookEvent, WebhookHandler};

use sqlx::PgPool;
use std::sync::Arc;

/// Aggregated billing service, wiring every sub-service to the same store
pub struct BillingService {
    pub quota: QuotaLedger,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::new(stripe, pool, CancellationNotifier::from_env()))
    }

    /// Create a new billing service with explicit config
    pub fn new(stripe: StripeClient, pool: PgPool, notifier: CancellationNotifier) -> Self {
        let store: Arc<dyn QuotaStore> = Arc::new(PgQuotaStore::new(pool));
        let quota = QuotaLedger::new(store.clone());
        let subscriptions = SubscriptionService::new(
            Arc::new(StripeProvider::new(stripe.clone())),
            store.clone(),
            quota.clone(),
            stripe.config().clone(),
            notifier,
        );
        let webhooks = WebhookHandler::new(store, subscriptions.clone());

        Self {
            quota,
            subscriptions,
            webhooks,
        }
    }
}
