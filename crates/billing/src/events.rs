//! Billing Events Module
//!
//! Append-only audit log of every verified webhook delivery. Rows are written
//! before dispatch so a delivery that later fails to apply can still be
//! diagnosed and replayed. Rows are never updated or deleted: how each
//! processing attempt ended is appended to a separate outcome log.
//!
//! Logging is best-effort: a failed audit write is reported to operational
//! logs but never blocks state application.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::objects::{event_category, WebhookEvent};
use crate::store::EventStore;

/// How processing of a logged delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingResult {
    Success,
    Ignored,
    Error,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Success => "success",
            ProcessingResult::Ignored => "ignored",
            ProcessingResult::Error => "error",
        }
    }
}

impl std::fmt::Display for ProcessingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored audit log row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub category: String,
    pub provider_event_id: String,
    pub livemode: bool,
    pub occurred_at: OffsetDateTime,
    pub recorded_at: OffsetDateTime,
    pub payload: serde_json::Value,
}

/// How one processing attempt of a delivery ended. One row per attempt, so a
/// redelivery that succeeds after a failure leaves both rows behind.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryOutcome {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub processing_result: String,
    pub error_message: Option<String>,
    pub recorded_at: OffsetDateTime,
}

/// An outcome row ready to be appended
#[derive(Debug, Clone)]
pub struct NewDeliveryOutcome {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub processing_result: ProcessingResult,
    pub error_message: Option<String>,
    pub recorded_at: OffsetDateTime,
}

impl NewDeliveryOutcome {
    pub fn new(event: &WebhookEvent, result: ProcessingResult, error_message: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            processing_result: result,
            error_message: error_message.map(str::to_string),
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}

/// A row ready to be appended
#[derive(Debug, Clone)]
pub struct NewBillingEvent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: String,
    pub category: String,
    pub provider_event_id: String,
    pub livemode: bool,
    pub occurred_at: OffsetDateTime,
    pub recorded_at: OffsetDateTime,
    pub payload: serde_json::Value,
}

/// Builder for audit rows
pub struct BillingEventBuilder {
    event_type: String,
    provider_event_id: String,
    user_id: Option<Uuid>,
    livemode: bool,
    occurred_at: Option<OffsetDateTime>,
    payload: serde_json::Value,
}

impl BillingEventBuilder {
    pub fn new(event_type: impl Into<String>, provider_event_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            provider_event_id: provider_event_id.into(),
            user_id: None,
            livemode: false,
            occurred_at: None,
            payload: serde_json::json!({}),
        }
    }

    /// Start from a verified delivery
    pub fn from_webhook(event: &WebhookEvent) -> Self {
        Self::new(&event.event_type, &event.id)
            .livemode(event.livemode)
            .occurred_at_unix(event.created)
            .payload(event.data.object.clone())
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn livemode(mut self, livemode: bool) -> Self {
        self.livemode = livemode;
        self
    }

    pub fn occurred_at_unix(mut self, created: i64) -> Self {
        self.occurred_at = OffsetDateTime::from_unix_timestamp(created).ok();
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> NewBillingEvent {
        let recorded_at = OffsetDateTime::now_utc();
        NewBillingEvent {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            category: event_category(&self.event_type).to_string(),
            event_type: self.event_type,
            provider_event_id: self.provider_event_id,
            livemode: self.livemode,
            occurred_at: self.occurred_at.unwrap_or(recorded_at),
            recorded_at,
            payload: self.payload,
        }
    }
}

/// Writes audit rows through an [`EventStore`]
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn EventStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Append a row. Returns false when the row already existed (redelivery).
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<bool> {
        let event = builder.build();
        let inserted = self.store.append(&event).await?;

        if !inserted {
            tracing::debug!(
                provider_event_id = %event.provider_event_id,
                event_type = %event.event_type,
                "Audit row already present - redelivery"
            );
        }

        Ok(inserted)
    }

    /// Record a verified delivery before dispatch. Failures are logged, never returned.
    pub async fn log_received(&self, event: &WebhookEvent) {
        if let Err(e) = self.log_event(BillingEventBuilder::from_webhook(event)).await {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Failed to write webhook audit row - continuing with processing"
            );
        }
    }

    /// Append how this processing attempt ended. Failures are logged, never returned.
    pub async fn log_outcome(
        &self,
        event: &WebhookEvent,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) {
        let outcome = NewDeliveryOutcome::new(event, result, error_message);
        if let Err(e) = self.store.append_outcome(&outcome).await {
            tracing::warn!(
                event_id = %event.id,
                processing_result = %result,
                error = %e,
                "Failed to record webhook processing outcome"
            );
        }
    }

    /// Every row written for one Stripe event
    pub async fn events_for(&self, provider_event_id: &str) -> BillingResult<Vec<BillingEvent>> {
        self.store.events_for(provider_event_id).await
    }

    /// Every processing attempt recorded for one Stripe event, oldest first
    pub async fn outcomes_for(&self, provider_event_id: &str) -> BillingResult<Vec<DeliveryOutcome>> {
        self.store.outcomes_for(provider_event_id).await
    }

    /// Deliveries whose latest attempt ended in an error, newest first, for
    /// diagnosis and replay from the Stripe dashboard
    pub async fn failed_deliveries(&self, limit: i64) -> BillingResult<Vec<DeliveryOutcome>> {
        self.store.list_failed(limit.clamp(1, 500)).await
    }
}
