//! Billing provider abstraction
//!
//! The reconciler only needs four outbound calls against the billing
//! authority. Keeping them behind a trait lets the router run against a
//! recording mock in tests.

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::objects::{CustomerSnapshot, Metadata, PriceSnapshot, SubscriptionSnapshot};

/// Outbound calls to the billing authority. Calls are not retried here.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Retrieve a customer by id
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<CustomerSnapshot>;

    /// Retrieve the live state of a subscription
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot>;

    /// Retrieve a price by id
    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot>;

    /// Set metadata keys on a subscription (existing keys not named are kept)
    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: &Metadata,
    ) -> BillingResult<()>;
}
