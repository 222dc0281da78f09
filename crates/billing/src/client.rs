//! Stripe API client

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use stripe::{Client, Customer, CustomerId, Price, PriceId, Subscription, SubscriptionId};

use crate::error::{BillingError, BillingResult};
use crate::objects::{CustomerSnapshot, Metadata, PriceSnapshot, SubscriptionSnapshot};
use crate::provider::BillingProvider;

/// Stripe credentials
#[derive(Clone)]
pub struct StripeConfig {
    /// Secret API key (`sk_live_...` / `sk_test_...`)
    pub secret_key: String,
    /// Webhook endpoint signing secret (`whsec_...`)
    pub webhook_secret: String,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"<redacted>")
            .field("webhook_secret", &"<redacted>")
            .finish()
    }
}

impl StripeConfig {
    /// Load from `STRIPE_SECRET_KEY` and `STRIPE_WEBHOOK_SECRET`; both are required
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required_env("STRIPE_SECRET_KEY")?,
            webhook_secret: required_env("STRIPE_WEBHOOK_SECRET")?,
        })
    }
}

fn required_env(name: &str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{} must be set", name))),
    }
}

/// Shared Stripe client, constructed once per process
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// Re-read a Stripe SDK object through our snapshot types
fn to_snapshot<S: Serialize, T: DeserializeOwned>(object: &S) -> BillingResult<T> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|e| BillingError::StripeApi(format!("unexpected Stripe object shape: {}", e)))
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<CustomerSnapshot> {
        let id: CustomerId = customer_id.parse().map_err(|e| {
            BillingError::InvalidInput(format!("invalid customer id {}: {}", customer_id, e))
        })?;

        let customer = Customer::retrieve(&self.inner, &id, &[]).await.map_err(|e| {
            tracing::error!(customer_id = %customer_id, error = %e, "Stripe customer retrieve failed");
            BillingError::from(e)
        })?;

        to_snapshot(&customer)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let id: SubscriptionId = subscription_id.parse().map_err(|e| {
            BillingError::InvalidInput(format!(
                "invalid subscription id {}: {}",
                subscription_id, e
            ))
        })?;

        let subscription = Subscription::retrieve(&self.inner, &id, &[])
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Stripe subscription retrieve failed"
                );
                BillingError::from(e)
            })?;

        to_snapshot(&subscription)
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot> {
        let id: PriceId = price_id.parse().map_err(|e| {
            BillingError::InvalidInput(format!("invalid price id {}: {}", price_id, e))
        })?;

        let price = Price::retrieve(&self.inner, &id, &[]).await.map_err(|e| {
            tracing::error!(price_id = %price_id, error = %e, "Stripe price retrieve failed");
            BillingError::from(e)
        })?;

        to_snapshot(&price)
    }

    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: &Metadata,
    ) -> BillingResult<()> {
        let id: SubscriptionId = subscription_id.parse().map_err(|e| {
            BillingError::InvalidInput(format!(
                "invalid subscription id {}: {}",
                subscription_id, e
            ))
        })?;

        let mut params = stripe::UpdateSubscription::new();
        params.metadata = Some(
            metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<String, String>>(),
        );

        Subscription::update(&self.inner, &id, params).await?;

        tracing::debug!(subscription_id = %subscription_id, "Updated Stripe subscription metadata");
        Ok(())
    }
}
