//! Persistence seams
//!
//! The reconciler owns two tables (`subscriptions`, `billing_events`) and reads
//! one (`users`). Postgres implementations live in [`crate::postgres`].

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::{BillingEvent, DeliveryOutcome, NewBillingEvent, NewDeliveryOutcome};
use crate::subscriptions::{SubscriptionPatch, SubscriptionRecord};

/// Local projection of Stripe subscriptions, keyed by `billing_subscription_id`
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Find a record by its Stripe subscription id
    async fn find_by_billing_id(
        &self,
        billing_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert or fully overwrite in one atomic operation. An existing row keeps its local `id`.
    async fn upsert(&self, record: &SubscriptionRecord) -> BillingResult<SubscriptionRecord>;

    /// Update only the fields carried by the patch. `None` when no record exists.
    async fn apply_patch(
        &self,
        billing_subscription_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Set the status alone. `None` when no record exists or the record is
    /// already `canceled`, which is terminal.
    async fn set_status(
        &self,
        billing_subscription_id: &str,
        status: &str,
        event_at: i64,
    ) -> BillingResult<Option<SubscriptionRecord>>;
}

/// Append-only audit log. Neither table is ever updated or deleted from.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a row; returns false if `(provider_event_id, event_type)` already exists
    async fn append(&self, event: &NewBillingEvent) -> BillingResult<bool>;

    /// Append the outcome of one processing attempt
    async fn append_outcome(&self, outcome: &NewDeliveryOutcome) -> BillingResult<()>;

    /// All rows written for one Stripe event, oldest first
    async fn events_for(&self, provider_event_id: &str) -> BillingResult<Vec<BillingEvent>>;

    /// All processing attempts for one Stripe event, oldest first
    async fn outcomes_for(&self, provider_event_id: &str) -> BillingResult<Vec<DeliveryOutcome>>;

    /// Deliveries whose latest attempt ended in an error, newest first
    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<DeliveryOutcome>>;
}

/// Read-only view of local user accounts
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Exact email match
    async fn find_user_id_by_email(&self, email: &str) -> BillingResult<Option<Uuid>>;
}
