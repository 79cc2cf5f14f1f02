//! Stripe client configuration

use clipflow_shared::Plan;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Catalog identifiers for each paid tier
    pub catalog: CatalogIds,
    /// Base URL for checkout return redirects
    pub app_base_url: String,
}

/// Stripe price and product identifiers for the paid tiers.
///
/// Checkout sessions are created from price ids; webhook-driven
/// classification maps the subscription's product id back to a plan.
/// Tier hierarchy: Free (no price) → Creator → Studio
#[derive(Debug, Clone)]
pub struct CatalogIds {
    pub creator_price: String,
    pub studio_price: String,
    pub creator_product: String,
    pub studio_product: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            catalog: CatalogIds {
                creator_price: std::env::var("STRIPE_PRICE_CREATOR").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_CREATOR not set".to_string())
                })?,
                studio_price: std::env::var("STRIPE_PRICE_STUDIO")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_STUDIO not set".to_string()))?,
                creator_product: std::env::var("STRIPE_PRODUCT_CREATOR").map_err(|_| {
                    BillingError::Config("STRIPE_PRODUCT_CREATOR not set".to_string())
                })?,
                studio_product: std::env::var("STRIPE_PRODUCT_STUDIO").map_err(|_| {
                    BillingError::Config("STRIPE_PRODUCT_STUDIO not set".to_string())
                })?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Get the checkout price id for a paid plan
    pub fn price_id_for_plan(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Creator => Some(&self.catalog.creator_price),
            Plan::Studio => Some(&self.catalog.studio_price),
            Plan::Free => None,
        }
    }

    /// Map a provider product id back to a plan
    pub fn plan_for_product_id(&self, product_id: &str) -> Option<Plan> {
        if product_id == self.catalog.creator_product {
            Some(Plan::Creator)
        } else if product_id == self.catalog.studio_product {
            Some(Plan::Studio)
        } else {
            None
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
