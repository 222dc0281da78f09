//! Subscription state application
//!
//! Projects Stripe subscription snapshots onto the local `subscriptions`
//! table. Every write is keyed on `billing_subscription_id`, so replaying the
//! same delivery converges on the same row instead of adding one.
//!
//! There is no version comparison on the write path: the latest received
//! snapshot wins. Each row remembers the newest provider timestamp it has seen
//! (`last_event_at`) so an out-of-order delivery is at least logged, and
//! [`StaleEventPolicy::Skip`] can drop it instead.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StaleEventPolicy;
use crate::error::{BillingError, BillingResult};
use crate::objects::{Metadata, PriceSnapshot, SubscriptionSnapshot, SYNCED_VIA_KEY, USER_ID_KEY};
use crate::provider::BillingProvider;
use crate::store::SubscriptionStore;

/// Local terminal state for subscriptions deleted in Stripe
pub const STATUS_CANCELED: &str = "canceled";

/// Status set when an invoice payment fails
pub const STATUS_PAST_DUE: &str = "past_due";

const SYNCED_VIA_WEBHOOK: &str = "webhook";

/// Local projection of a Stripe subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Local identity, stable across upserts
    pub id: Uuid,
    /// Stripe subscription id, unique
    pub billing_subscription_id: String,
    pub user_id: Uuid,
    pub customer_id: Option<String>,
    pub price_id: String,
    pub currency: String,
    pub billing_interval: String,
    /// Stripe status vocabulary, verbatim
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    /// Unit price in minor currency units
    pub amount: i64,
    pub started_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub metadata: Metadata,
    /// Provider timestamp of the newest event applied to this row
    pub last_event_at: Option<i64>,
}

impl SubscriptionRecord {
    /// Build the full field set from a snapshot and its resolved price
    pub fn from_snapshot(
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        price: &PriceSnapshot,
        occurred_at: i64,
    ) -> Self {
        let (current_period_start, current_period_end) = snapshot.period();

        Self {
            id: Uuid::new_v4(),
            billing_subscription_id: snapshot.id.clone(),
            user_id,
            customer_id: snapshot.customer.clone(),
            price_id: price.id.clone(),
            currency: price.currency.clone().unwrap_or_default(),
            billing_interval: price
                .recurring
                .as_ref()
                .map(|r| r.interval.clone())
                .unwrap_or_default(),
            status: snapshot.status.clone(),
            current_period_start,
            current_period_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
            amount: price.unit_amount.unwrap_or_default(),
            started_at: snapshot.start_date,
            canceled_at: snapshot.canceled_at,
            ended_at: snapshot.ended_at,
            metadata: stamped_metadata(&snapshot.metadata, user_id),
            last_event_at: Some(occurred_at),
        }
    }

    /// True when `occurred_at` predates the newest event already applied
    pub fn is_newer_than(&self, occurred_at: i64) -> bool {
        self.last_event_at.is_some_and(|last| occurred_at < last)
    }

    pub fn is_canceled(&self) -> bool {
        self.status == STATUS_CANCELED
    }
}

fn stamped_metadata(metadata: &Metadata, user_id: Uuid) -> Metadata {
    let mut stamped = metadata.clone();
    stamped.insert(USER_ID_KEY, user_id.to_string());
    stamped.insert(SYNCED_VIA_KEY, SYNCED_VIA_WEBHOOK);
    stamped
}

/// Fields carried by `customer.subscription.updated` / `.deleted` deltas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPatch {
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// Merged over the stored metadata; the stored `user_id` key always wins
    pub metadata: Metadata,
    pub event_at: i64,
}

impl SubscriptionPatch {
    pub fn from_snapshot(snapshot: &SubscriptionSnapshot, event_at: i64) -> Self {
        let (current_period_start, current_period_end) = snapshot.period();
        Self {
            status: snapshot.status.clone(),
            current_period_start,
            current_period_end,
            cancel_at_period_end: snapshot.cancel_at_period_end,
            canceled_at: snapshot.canceled_at,
            ended_at: snapshot.ended_at,
            metadata: snapshot.metadata.clone(),
            event_at,
        }
    }

    /// Deletion delta: status forced to `canceled` whatever Stripe reported
    pub fn canceled(snapshot: &SubscriptionSnapshot, event_at: i64) -> Self {
        let mut patch = Self::from_snapshot(snapshot, event_at);
        patch.status = STATUS_CANCELED.to_string();
        patch.canceled_at = patch.canceled_at.or(Some(event_at));
        patch.ended_at = patch.ended_at.or(Some(event_at));
        patch
    }

    /// Reference semantics of a patch, mirrored by the SQL in the Postgres store
    pub fn apply_to(&self, record: &mut SubscriptionRecord) {
        record.status = self.status.clone();
        record.current_period_start = self.current_period_start;
        record.current_period_end = self.current_period_end;
        record.cancel_at_period_end = self.cancel_at_period_end;
        record.canceled_at = self.canceled_at;
        record.ended_at = self.ended_at;
        record.metadata = record.metadata.merged_with(&self.metadata);
        record
            .metadata
            .insert(USER_ID_KEY, record.user_id.to_string());
        record.last_event_at = Some(
            record
                .last_event_at
                .map_or(self.event_at, |last| last.max(self.event_at)),
        );
    }
}

/// Result of applying an event to the subscriptions table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The row as it stands after the write
    Applied(SubscriptionRecord),
    /// Event predates the stored state and the skip policy is active
    SkippedStale { last_event_at: i64 },
    /// Partial update for a subscription with no local row
    NotFound,
    /// Record is already canceled; status transitions no longer apply to it
    Retired(SubscriptionRecord),
}

/// Applies snapshots and deltas to the subscription store
#[derive(Clone)]
pub struct SubscriptionApplier {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn BillingProvider>,
    stale_policy: StaleEventPolicy,
}

impl SubscriptionApplier {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn BillingProvider>,
        stale_policy: StaleEventPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            stale_policy,
        }
    }

    pub async fn find(&self, billing_subscription_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.find_by_billing_id(billing_subscription_id).await
    }

    /// Full upsert from a snapshot for a resolved user
    pub async fn apply_snapshot(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        occurred_at: i64,
    ) -> BillingResult<ApplyOutcome> {
        self.apply_full(user_id, snapshot, occurred_at, None).await
    }

    /// Full upsert for a subscription that Stripe already deleted
    pub async fn apply_canceled_snapshot(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        occurred_at: i64,
    ) -> BillingResult<ApplyOutcome> {
        self.apply_full(user_id, snapshot, occurred_at, Some(STATUS_CANCELED))
            .await
    }

    /// Partial update from a `customer.subscription.updated` delta
    pub async fn apply_update(
        &self,
        snapshot: &SubscriptionSnapshot,
        occurred_at: i64,
    ) -> BillingResult<ApplyOutcome> {
        self.apply_partial(snapshot, SubscriptionPatch::from_snapshot(snapshot, occurred_at))
            .await
    }

    /// Partial update from a `customer.subscription.deleted` delta
    pub async fn apply_deletion(
        &self,
        snapshot: &SubscriptionSnapshot,
        occurred_at: i64,
    ) -> BillingResult<ApplyOutcome> {
        self.apply_partial(snapshot, SubscriptionPatch::canceled(snapshot, occurred_at))
            .await
    }

    /// Invoice payment failed: move the record to `past_due`. Canceled records
    /// stay canceled, and the stale policy applies as for subscription events.
    pub async fn mark_past_due(
        &self,
        billing_subscription_id: &str,
        occurred_at: i64,
    ) -> BillingResult<ApplyOutcome> {
        let Some(existing) = self.store.find_by_billing_id(billing_subscription_id).await? else {
            return Ok(ApplyOutcome::NotFound);
        };

        if existing.is_canceled() {
            tracing::warn!(
                subscription_id = %billing_subscription_id,
                "Payment failed for a canceled subscription - keeping status canceled"
            );
            return Ok(ApplyOutcome::Retired(existing));
        }

        if let Some(outcome) = self.check_stale(&existing, occurred_at) {
            return Ok(outcome);
        }

        let updated = self
            .store
            .set_status(billing_subscription_id, STATUS_PAST_DUE, occurred_at)
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id = %billing_subscription_id,
                    error = %e,
                    "Failed to mark subscription past_due"
                );
                e
            })?;

        match updated {
            Some(record) => {
                tracing::info!(
                    subscription_id = %billing_subscription_id,
                    previous_status = %existing.status,
                    "Subscription marked past_due"
                );
                Ok(ApplyOutcome::Applied(record))
            }
            // Canceled between the read and the guarded write
            None => match self.store.find_by_billing_id(billing_subscription_id).await? {
                Some(record) if record.is_canceled() => Ok(ApplyOutcome::Retired(record)),
                _ => Err(BillingError::Internal(format!(
                    "subscription {} disappeared during update",
                    billing_subscription_id
                ))),
            },
        }
    }

    async fn apply_full(
        &self,
        user_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        occurred_at: i64,
        status_override: Option<&str>,
    ) -> BillingResult<ApplyOutcome> {
        let existing = self.store.find_by_billing_id(&snapshot.id).await?;

        if let Some(existing) = &existing {
            if let Some(outcome) = self.check_stale(existing, occurred_at) {
                return Ok(outcome);
            }
            if existing.user_id != user_id {
                tracing::warn!(
                    subscription_id = %snapshot.id,
                    stored_user_id = %existing.user_id,
                    resolved_user_id = %user_id,
                    "Subscription re-resolved to a different user - overwriting"
                );
            }
        }

        let price = self.resolve_price(snapshot).await?;
        let mut record = SubscriptionRecord::from_snapshot(user_id, snapshot, &price, occurred_at);
        if let Some(status) = status_override {
            record.status = status.to_string();
            record.canceled_at = record.canceled_at.or(Some(occurred_at));
            record.ended_at = record.ended_at.or(Some(occurred_at));
        }

        let stored = self.store.upsert(&record).await.map_err(|e| {
            tracing::error!(
                subscription_id = %snapshot.id,
                user_id = %user_id,
                error = %e,
                "Failed to upsert subscription record"
            );
            e
        })?;

        tracing::info!(
            subscription_id = %stored.billing_subscription_id,
            user_id = %stored.user_id,
            status = %stored.status,
            created = existing.is_none(),
            "Subscription record upserted"
        );

        Ok(ApplyOutcome::Applied(stored))
    }

    async fn apply_partial(
        &self,
        snapshot: &SubscriptionSnapshot,
        patch: SubscriptionPatch,
    ) -> BillingResult<ApplyOutcome> {
        let Some(existing) = self.store.find_by_billing_id(&snapshot.id).await? else {
            return Ok(ApplyOutcome::NotFound);
        };

        if let Some(outcome) = self.check_stale(&existing, patch.event_at) {
            return Ok(outcome);
        }

        let updated = self
            .store
            .apply_patch(&snapshot.id, &patch)
            .await
            .map_err(|e| {
                tracing::error!(
                    subscription_id = %snapshot.id,
                    error = %e,
                    "Failed to update subscription record"
                );
                e
            })?;

        match updated {
            Some(record) => {
                tracing::info!(
                    subscription_id = %record.billing_subscription_id,
                    previous_status = %existing.status,
                    status = %record.status,
                    "Subscription record updated"
                );
                Ok(ApplyOutcome::Applied(record))
            }
            // Row vanished between read and write; rows are never deleted so this is unexpected
            None => Err(BillingError::Internal(format!(
                "subscription {} disappeared during update",
                snapshot.id
            ))),
        }
    }

    fn check_stale(&self, existing: &SubscriptionRecord, occurred_at: i64) -> Option<ApplyOutcome> {
        if !existing.is_newer_than(occurred_at) {
            return None;
        }

        let last_event_at = existing.last_event_at.unwrap_or_default();
        tracing::warn!(
            subscription_id = %existing.billing_subscription_id,
            occurred_at = occurred_at,
            last_event_at = last_event_at,
            policy = ?self.stale_policy,
            "Out-of-order subscription event: older than the last applied event"
        );

        match self.stale_policy {
            StaleEventPolicy::Apply => None,
            StaleEventPolicy::Skip => Some(ApplyOutcome::SkippedStale { last_event_at }),
        }
    }

    /// Embedded price when complete, otherwise a price lookup
    async fn resolve_price(&self, snapshot: &SubscriptionSnapshot) -> BillingResult<PriceSnapshot> {
        let embedded = snapshot
            .first_item()
            .and_then(|item| item.price.clone())
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "subscription {} has no priced item",
                    snapshot.id
                ))
            })?;

        if embedded.is_complete() {
            return Ok(embedded);
        }

        tracing::debug!(
            subscription_id = %snapshot.id,
            price_id = %embedded.id,
            "Embedded price incomplete - retrieving from Stripe"
        );

        let price = self.provider.retrieve_price(&embedded.id).await.map_err(|e| {
            tracing::error!(
                subscription_id = %snapshot.id,
                price_id = %embedded.id,
                error = %e,
                "Price lookup failed"
            );
            e
        })?;

        if !price.is_complete() {
            tracing::warn!(
                price_id = %price.id,
                "Price is missing currency, amount or interval - storing defaults"
            );
        }

        Ok(price)
    }
}
