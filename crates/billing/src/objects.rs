//! Stripe object snapshots
//!
//! Lightweight views over the Stripe resources the reconciler reads. Webhook
//! payloads and objects fetched through the API client both deserialize into
//! these types, so a snapshot looks the same whichever way it arrived.
//! Unknown fields are ignored, which keeps parsing stable across Stripe API
//! versions.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BillingError, BillingResult};

/// Metadata key carrying the local user id
pub const USER_ID_KEY: &str = "user_id";

/// Legacy metadata key written by older checkout flows
pub const LEGACY_USER_ID_KEY: &str = "supabase_user_id";

/// Metadata key marking how a record was last written
pub const SYNCED_VIA_KEY: &str = "synced_via";

/// Stripe metadata: an open string-to-string map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Raw user id hint: `user_id`, then `supabase_user_id`. Blank values are skipped.
    pub fn user_id_hint(&self) -> Option<&str> {
        [USER_ID_KEY, LEGACY_USER_ID_KEY]
            .into_iter()
            .filter_map(|key| self.get(key))
            .map(str::trim)
            .find(|value| !value.is_empty())
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merged_with(&self, other: &Metadata) -> Metadata {
        let mut merged = self.clone();
        for (key, value) in other.iter() {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

impl From<BTreeMap<String, String>> for Metadata {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Metadata {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// Signed event envelope delivered to the webhook endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    #[serde(default)]
    pub livemode: bool,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    /// Coarse classification: the part of the event type before the first `.`
    pub fn category(&self) -> &str {
        event_category(&self.event_type)
    }

    /// Parse `data.object` into a typed snapshot
    pub fn object<T: for<'de> Deserialize<'de>>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::InvalidInput(format!(
                "event {} ({}) has an unexpected object: {}",
                self.id, self.event_type, e
            ))
        })
    }
}

/// Prefix of an event type before the first `.`
pub fn event_category(event_type: &str) -> &str {
    event_type.split('.').next().unwrap_or(event_type)
}

/// Subscription as seen in `customer.subscription.*` events and `GET /v1/subscriptions/:id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub start_date: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
    #[serde(default, deserialize_with = "null_as_default")]
    pub items: ItemList,
}

impl SubscriptionSnapshot {
    pub fn first_item(&self) -> Option<&SubscriptionItemSnapshot> {
        self.items.data.first()
    }

    /// Billing window. Newer API versions only carry it on the items.
    pub fn period(&self) -> (i64, i64) {
        let item = self.first_item();
        let start = self
            .current_period_start
            .or_else(|| item.and_then(|i| i.current_period_start))
            .unwrap_or_default();
        let end = self
            .current_period_end
            .or_else(|| item.and_then(|i| i.current_period_end))
            .unwrap_or_default();
        (start, end)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItemSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItemSnapshot {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub price: Option<PriceSnapshot>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub id: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub recurring: Option<Recurring>,
}

impl PriceSnapshot {
    /// True when currency, amount and interval are all present
    pub fn is_complete(&self) -> bool {
        self.currency.is_some() && self.unit_amount.is_some() && self.recurring.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurring {
    pub interval: String,
}

/// Checkout session from `checkout.session.completed`
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionSnapshot {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: Metadata,
}

/// Invoice from `invoice.payment_succeeded` / `invoice.payment_failed`
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceSnapshot {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub amount_due: Option<i64>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub attempt_count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceSubscriptionDetails {
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
}

impl InvoiceSnapshot {
    /// Associated subscription, from either the legacy or the `parent` location
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_deref().or_else(|| {
            self.parent
                .as_ref()
                .and_then(|p| p.subscription_details.as_ref())
                .and_then(|d| d.subscription.as_deref())
        })
    }
}

/// Customer as returned by `GET /v1/customers/:id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// Accepts an id string, an expanded object with an `id`, or null.
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    Ok(
        Option::<Expandable>::deserialize(deserializer)?.map(|e| match e {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }),
    )
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
