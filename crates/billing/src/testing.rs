//! In-memory stores and a recording Stripe mock
//!
//! Available to this crate's tests and, through the `test-util` feature, to
//! downstream crates that exercise the webhook route without Postgres or Stripe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{
    BillingEvent, DeliveryOutcome, NewBillingEvent, NewDeliveryOutcome, ProcessingResult,
};
use crate::objects::{CustomerSnapshot, Metadata, PriceSnapshot, SubscriptionSnapshot};
use crate::provider::BillingProvider;
use crate::store::{EventStore, SubscriptionStore, UserDirectory};
use crate::subscriptions::{SubscriptionPatch, SubscriptionRecord};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// `subscriptions` table keyed by `billing_subscription_id`
#[derive(Default)]
pub struct MemorySubscriptionStore {
    rows: Mutex<HashMap<String, SubscriptionRecord>>,
    fail_writes: AtomicBool,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly
    pub fn insert(&self, record: SubscriptionRecord) {
        lock(&self.rows).insert(record.billing_subscription_id.clone(), record);
    }

    pub fn get(&self, billing_subscription_id: &str) -> Option<SubscriptionRecord> {
        lock(&self.rows).get(billing_subscription_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every subsequent write fail with a database error
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    fn check_writable(&self) -> BillingResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Database("subscriptions table unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find_by_billing_id(
        &self,
        billing_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.get(billing_subscription_id))
    }

    async fn upsert(&self, record: &SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        self.check_writable()?;
        let mut rows = lock(&self.rows);
        let mut stored = record.clone();
        if let Some(existing) = rows.get(&record.billing_subscription_id) {
            stored.id = existing.id;
            stored.last_event_at = match (existing.last_event_at, record.last_event_at) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        rows.insert(stored.billing_subscription_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn apply_patch(
        &self,
        billing_subscription_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check_writable()?;
        let mut rows = lock(&self.rows);
        Ok(rows.get_mut(billing_subscription_id).map(|record| {
            patch.apply_to(record);
            record.clone()
        }))
    }

    async fn set_status(
        &self,
        billing_subscription_id: &str,
        status: &str,
        event_at: i64,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.check_writable()?;
        let mut rows = lock(&self.rows);
        Ok(rows
            .get_mut(billing_subscription_id)
            .filter(|record| !record.is_canceled())
            .map(|record| {
                record.status = status.to_string();
                record.last_event_at =
                    Some(record.last_event_at.map_or(event_at, |l| l.max(event_at)));
                record.clone()
            }))
    }
}

/// `billing_events` table
#[derive(Default)]
pub struct MemoryEventStore {
    rows: Mutex<Vec<BillingEvent>>,
    outcomes: Mutex<Vec<DeliveryOutcome>>,
    fail: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle failure of every call, simulating an unreachable audit table
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<BillingEvent> {
        lock(&self.rows).clone()
    }

    /// Outcome rows in append order
    pub fn outcomes(&self) -> Vec<DeliveryOutcome> {
        lock(&self.outcomes).clone()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<BillingEvent> {
        lock(&self.rows)
            .iter()
            .filter(|row| row.event_type == event_type)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError::Database("billing_events table unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, event: &NewBillingEvent) -> BillingResult<bool> {
        self.check_available()?;
        let mut rows = lock(&self.rows);
        if rows.iter().any(|row| {
            row.provider_event_id == event.provider_event_id && row.event_type == event.event_type
        }) {
            return Ok(false);
        }

        rows.push(BillingEvent {
            id: event.id,
            user_id: event.user_id,
            event_type: event.event_type.clone(),
            category: event.category.clone(),
            provider_event_id: event.provider_event_id.clone(),
            livemode: event.livemode,
            occurred_at: event.occurred_at,
            recorded_at: event.recorded_at,
            payload: event.payload.clone(),
        });
        Ok(true)
    }

    async fn append_outcome(&self, outcome: &NewDeliveryOutcome) -> BillingResult<()> {
        self.check_available()?;
        lock(&self.outcomes).push(DeliveryOutcome {
            id: outcome.id,
            provider_event_id: outcome.provider_event_id.clone(),
            event_type: outcome.event_type.clone(),
            processing_result: outcome.processing_result.as_str().to_string(),
            error_message: outcome.error_message.clone(),
            recorded_at: outcome.recorded_at,
        });
        Ok(())
    }

    async fn events_for(&self, provider_event_id: &str) -> BillingResult<Vec<BillingEvent>> {
        self.check_available()?;
        let mut rows: Vec<BillingEvent> = lock(&self.rows)
            .iter()
            .filter(|row| row.provider_event_id == provider_event_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.recorded_at);
        Ok(rows)
    }

    async fn outcomes_for(&self, provider_event_id: &str) -> BillingResult<Vec<DeliveryOutcome>> {
        self.check_available()?;
        Ok(lock(&self.outcomes)
            .iter()
            .filter(|row| row.provider_event_id == provider_event_id)
            .cloned()
            .collect())
    }

    async fn list_failed(&self, limit: i64) -> BillingResult<Vec<DeliveryOutcome>> {
        self.check_available()?;
        // Latest attempt per delivery, in append order
        let mut latest: Vec<DeliveryOutcome> = Vec::new();
        for outcome in lock(&self.outcomes).iter() {
            latest.retain(|o| {
                o.provider_event_id != outcome.provider_event_id
                    || o.event_type != outcome.event_type
            });
            latest.push(outcome.clone());
        }

        let mut failed: Vec<DeliveryOutcome> = latest
            .into_iter()
            .filter(|row| row.processing_result == ProcessingResult::Error.as_str())
            .collect();
        failed.reverse();
        failed.truncate(usize::try_from(limit).unwrap_or_default());
        Ok(failed)
    }
}

/// `users` table, email lookup only
#[derive(Default)]
pub struct MemoryUserDirectory {
    by_email: Mutex<HashMap<String, Uuid>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, user_id: Uuid, email: &str) {
        lock(&self.by_email).insert(email.to_string(), user_id);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_user_id_by_email(&self, email: &str) -> BillingResult<Option<Uuid>> {
        Ok(lock(&self.by_email).get(email).copied())
    }
}

#[derive(Default)]
struct MockState {
    customers: HashMap<String, CustomerSnapshot>,
    subscriptions: HashMap<String, SubscriptionSnapshot>,
    prices: HashMap<String, PriceSnapshot>,
    customer_retrievals: Vec<String>,
    subscription_retrievals: Vec<String>,
    price_retrievals: Vec<String>,
    metadata_updates: Vec<(String, Metadata)>,
    fail_customers: bool,
    fail_subscriptions: bool,
    fail_prices: bool,
    fail_metadata_updates: bool,
}

/// Stripe stand-in serving canned objects and recording every call
#[derive(Default)]
pub struct MockBillingProvider {
    state: Mutex<MockState>,
}

impl MockBillingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_customer(&self, customer_id: &str, email: Option<&str>) {
        lock(&self.state).customers.insert(
            customer_id.to_string(),
            CustomerSnapshot {
                id: customer_id.to_string(),
                email: email.map(str::to_string),
                deleted: false,
            },
        );
    }

    pub fn add_subscription(&self, subscription: SubscriptionSnapshot) {
        lock(&self.state)
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn add_price(&self, price: PriceSnapshot) {
        lock(&self.state).prices.insert(price.id.clone(), price);
    }

    pub fn fail_customer_lookups(&self) {
        lock(&self.state).fail_customers = true;
    }

    pub fn fail_subscription_lookups(&self) {
        lock(&self.state).fail_subscriptions = true;
    }

    pub fn fail_price_lookups(&self) {
        lock(&self.state).fail_prices = true;
    }

    pub fn fail_metadata_updates(&self) {
        lock(&self.state).fail_metadata_updates = true;
    }

    pub fn customer_retrievals(&self) -> usize {
        lock(&self.state).customer_retrievals.len()
    }

    pub fn subscription_retrievals(&self) -> Vec<String> {
        lock(&self.state).subscription_retrievals.clone()
    }

    pub fn price_retrievals(&self) -> usize {
        lock(&self.state).price_retrievals.len()
    }

    pub fn metadata_updates(&self) -> Vec<(String, Metadata)> {
        lock(&self.state).metadata_updates.clone()
    }
}

fn no_such(kind: &str, id: &str) -> BillingError {
    BillingError::StripeApi(format!("No such {}: '{}'", kind, id))
}

#[async_trait]
impl BillingProvider for MockBillingProvider {
    async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<CustomerSnapshot> {
        let mut state = lock(&self.state);
        state.customer_retrievals.push(customer_id.to_string());
        if state.fail_customers {
            return Err(BillingError::StripeApi("customer lookup failed".into()));
        }
        state
            .customers
            .get(customer_id)
            .cloned()
            .ok_or_else(|| no_such("customer", customer_id))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionSnapshot> {
        let mut state = lock(&self.state);
        state
            .subscription_retrievals
            .push(subscription_id.to_string());
        if state.fail_subscriptions {
            return Err(BillingError::StripeApi("subscription lookup failed".into()));
        }
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| no_such("subscription", subscription_id))
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<PriceSnapshot> {
        let mut state = lock(&self.state);
        state.price_retrievals.push(price_id.to_string());
        if state.fail_prices {
            return Err(BillingError::StripeApi("price lookup failed".into()));
        }
        state
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| no_such("price", price_id))
    }

    async fn update_subscription_metadata(
        &self,
        subscription_id: &str,
        metadata: &Metadata,
    ) -> BillingResult<()> {
        let mut state = lock(&self.state);
        state
            .metadata_updates
            .push((subscription_id.to_string(), metadata.clone()));
        if state.fail_metadata_updates {
            return Err(BillingError::StripeApi("metadata update failed".into()));
        }
        Ok(())
    }
}
