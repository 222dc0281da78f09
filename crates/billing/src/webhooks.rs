//! Stripe webhook handling
//!
//! Verifies deliveries, writes the audit row, and routes subscription,
//! checkout and invoice events onto the local subscriptions table.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::{BillingMode, ReconcilerConfig};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, ProcessingResult};
use crate::objects::{
    CheckoutSessionSnapshot, InvoiceSnapshot, Metadata, SubscriptionSnapshot, WebhookEvent,
    USER_ID_KEY,
};
use crate::provider::BillingProvider;
use crate::resolver::{ResolutionContext, UserResolver};
use crate::signature::SignatureVerifier;
use crate::store::{EventStore, SubscriptionStore, UserDirectory};
use crate::subscriptions::{ApplyOutcome, SubscriptionApplier};

pub const SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const INVOICE_PAYMENT_SUCCEEDED: &str = "invoice.payment_succeeded";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

/// Audit rows appended by the invoice handlers
pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const PAYMENT_FAILED: &str = "payment.failed";

/// Successful handling; both variants are acknowledged with 200
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// State was written
    Processed(String),
    /// Acknowledged without a state change
    Ignored(String),
}

impl WebhookOutcome {
    pub fn message(&self) -> &str {
        match self {
            WebhookOutcome::Processed(msg) | WebhookOutcome::Ignored(msg) => msg,
        }
    }

    fn processing_result(&self) -> ProcessingResult {
        match self {
            WebhookOutcome::Processed(_) => ProcessingResult::Success,
            WebhookOutcome::Ignored(_) => ProcessingResult::Ignored,
        }
    }
}

/// Collaborators the handler writes to and reads from
#[derive(Clone)]
pub struct WebhookDependencies {
    pub provider: Arc<dyn BillingProvider>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub events: Arc<dyn EventStore>,
    pub users: Arc<dyn UserDirectory>,
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    verifier: SignatureVerifier,
    mode: BillingMode,
    provider: Arc<dyn BillingProvider>,
    resolver: UserResolver,
    applier: SubscriptionApplier,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: impl Into<String>,
        config: &ReconcilerConfig,
        deps: WebhookDependencies,
    ) -> Self {
        Self {
            verifier: SignatureVerifier::new(webhook_secret, config.signature_tolerance_secs),
            mode: config.mode,
            resolver: UserResolver::new(deps.provider.clone(), deps.users),
            applier: SubscriptionApplier::new(
                deps.subscriptions,
                deps.provider.clone(),
                config.stale_event_policy,
            ),
            provider: deps.provider,
            event_logger: BillingEventLogger::new(deps.events),
        }
    }

    pub fn event_logger(&self) -> &BillingEventLogger {
        &self.event_logger
    }

    /// Verify a raw delivery and process it
    pub async fn handle_delivery(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        let signature = signature.ok_or_else(|| {
            tracing::warn!(payload_len = payload.len(), "Webhook delivery without Stripe-Signature header");
            BillingError::WebhookSignatureMissing
        })?;

        let event = self.verifier.verify(payload, signature).map_err(|e| {
            tracing::warn!(error = %e, "Rejected webhook delivery");
            e
        })?;

        self.handle_event(&event).await
    }

    /// Process a verified event: audit row first, then dispatch, then outcome
    pub async fn handle_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            livemode = event.livemode,
            "Processing Stripe webhook event"
        );

        self.event_logger.log_received(event).await;

        let result = if self.mode.accepts(event.livemode) {
            self.dispatch(event).await
        } else {
            tracing::info!(
                event_id = %event.id,
                livemode = event.livemode,
                mode = %self.mode,
                "Event mode does not match billing mode - acknowledging without changes"
            );
            Ok(WebhookOutcome::Ignored(format!(
                "{} event ignored in {} mode",
                if event.livemode { "Live" } else { "Test" },
                self.mode
            )))
        };

        match &result {
            Ok(outcome) => {
                self.event_logger
                    .log_outcome(event, outcome.processing_result(), None)
                    .await;
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    client_error = e.is_client_error(),
                    "Webhook event processing failed"
                );
                let message = e.to_string();
                self.event_logger
                    .log_outcome(event, ProcessingResult::Error, Some(&message))
                    .await;
            }
        }

        result
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match event.event_type.as_str() {
            SUBSCRIPTION_CREATED => self.handle_subscription_created(event).await,
            SUBSCRIPTION_UPDATED => self.handle_subscription_updated(event).await,
            SUBSCRIPTION_DELETED => self.handle_subscription_deleted(event).await,
            CHECKOUT_COMPLETED => self.handle_checkout_completed(event).await,
            INVOICE_PAYMENT_SUCCEEDED => self.handle_invoice_payment(event, PaymentResult::Succeeded).await,
            INVOICE_PAYMENT_FAILED => self.handle_invoice_payment(event, PaymentResult::Failed).await,
            other => {
                tracing::info!(
                    event_type = %other,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(WebhookOutcome::Ignored(format!("Unhandled event type {}", other)))
            }
        }
    }

    async fn handle_subscription_created(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let subscription: SubscriptionSnapshot = event.object()?;
        let ctx = subscription_context(&subscription);
        self.resolve_and_apply(event, &subscription, &ctx, false).await
    }

    async fn handle_subscription_updated(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let subscription: SubscriptionSnapshot = event.object()?;

        match self.applier.apply_update(&subscription, event.created).await? {
            ApplyOutcome::NotFound => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    "No local record for updated subscription - running full sync"
                );
                let ctx = subscription_context(&subscription);
                self.resolve_and_apply(event, &subscription, &ctx, false).await
            }
            outcome => Ok(outcome_to_webhook(&subscription.id, outcome)),
        }
    }

    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let subscription: SubscriptionSnapshot = event.object()?;

        match self.applier.apply_deletion(&subscription, event.created).await? {
            ApplyOutcome::NotFound => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    "No local record for deleted subscription - recording it as canceled"
                );
                let ctx = subscription_context(&subscription);
                self.resolve_and_apply(event, &subscription, &ctx, true).await
            }
            outcome => Ok(outcome_to_webhook(&subscription.id, outcome)),
        }
    }

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let session: CheckoutSessionSnapshot = event.object()?;

        let Some(subscription_id) = session.subscription.as_deref() else {
            tracing::info!(
                session_id = %session.id,
                mode = ?session.mode,
                "Checkout session has no subscription - nothing to sync"
            );
            return Ok(WebhookOutcome::Ignored(format!(
                "Checkout session {} has no subscription",
                session.id
            )));
        };

        let subscription = self.provider.retrieve_subscription(subscription_id).await?;

        let ctx = ResolutionContext {
            subject: &session.id,
            metadata: Some(&session.metadata),
            related_metadata: Some(&subscription.metadata),
            client_reference_id: session.client_reference_id.as_deref(),
            customer_id: session
                .customer
                .as_deref()
                .or(subscription.customer.as_deref()),
        };

        self.resolve_and_apply(event, &subscription, &ctx, false).await
    }

    async fn handle_invoice_payment(
        &self,
        event: &WebhookEvent,
        result: PaymentResult,
    ) -> BillingResult<WebhookOutcome> {
        let invoice: InvoiceSnapshot = event.object()?;

        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice is not tied to a subscription");
            return Ok(WebhookOutcome::Ignored(format!(
                "Invoice {} has no subscription",
                invoice.id
            )));
        };

        let outcome = match result {
            PaymentResult::Failed => {
                self.applier
                    .mark_past_due(subscription_id, event.created)
                    .await?
            }
            PaymentResult::Succeeded => match self.applier.find(subscription_id).await? {
                Some(record) => ApplyOutcome::Applied(record),
                None => ApplyOutcome::NotFound,
            },
        };

        let user_id = match &outcome {
            ApplyOutcome::Applied(record) | ApplyOutcome::Retired(record) => Some(record.user_id),
            ApplyOutcome::SkippedStale { .. } | ApplyOutcome::NotFound => None,
        };
        self.log_payment(event, &invoice, subscription_id, result, user_id)
            .await;

        match outcome {
            ApplyOutcome::Applied(record) => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    subscription_id = %subscription_id,
                    user_id = %record.user_id,
                    status = %record.status,
                    payment = result.as_str(),
                    "Invoice payment recorded"
                );
                Ok(WebhookOutcome::Processed(format!(
                    "Payment {} for subscription {}",
                    result.as_str(),
                    subscription_id
                )))
            }
            ApplyOutcome::NotFound => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    subscription_id = %subscription_id,
                    payment = result.as_str(),
                    "Invoice references a subscription with no local record"
                );
                Ok(outcome_to_webhook(subscription_id, ApplyOutcome::NotFound))
            }
            other => Ok(outcome_to_webhook(subscription_id, other)),
        }
    }

    async fn log_payment(
        &self,
        event: &WebhookEvent,
        invoice: &InvoiceSnapshot,
        subscription_id: &str,
        result: PaymentResult,
        user_id: Option<Uuid>,
    ) {
        let amount = match result {
            PaymentResult::Succeeded => invoice.amount_paid,
            PaymentResult::Failed => invoice.amount_due,
        };

        let mut builder = BillingEventBuilder::new(result.event_type(), &event.id)
            .livemode(event.livemode)
            .occurred_at_unix(event.created)
            .payload(serde_json::json!({
                "invoice_id": invoice.id,
                "subscription_id": subscription_id,
                "amount": amount,
                "currency": invoice.currency,
                "status": result.as_str(),
                "attempt_count": invoice.attempt_count,
            }));
        if let Some(user_id) = user_id {
            builder = builder.user(user_id);
        }

        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(
                event_id = %event.id,
                invoice_id = %invoice.id,
                error = %e,
                "Failed to write payment audit row"
            );
        }
    }

    async fn resolve_and_apply(
        &self,
        event: &WebhookEvent,
        subscription: &SubscriptionSnapshot,
        ctx: &ResolutionContext<'_>,
        canceled: bool,
    ) -> BillingResult<WebhookOutcome> {
        let resolution = self.resolver.resolve(ctx).await?;

        let outcome = if canceled {
            self.applier
                .apply_canceled_snapshot(resolution.user_id, subscription, event.created)
                .await?
        } else {
            self.applier
                .apply_snapshot(resolution.user_id, subscription, event.created)
                .await?
        };

        if matches!(outcome, ApplyOutcome::Applied(_)) && !resolution.strategy.is_metadata() {
            self.backfill_user_id(&subscription.id, resolution.user_id, ctx)
                .await;
        }

        Ok(outcome_to_webhook(&subscription.id, outcome))
    }

    /// Write `user_id` onto the Stripe subscription so later deliveries resolve by metadata
    async fn backfill_user_id(
        &self,
        subscription_id: &str,
        user_id: Uuid,
        ctx: &ResolutionContext<'_>,
    ) {
        let mut metadata = Metadata::new();
        metadata.insert(USER_ID_KEY, user_id.to_string());

        match self
            .provider
            .update_subscription_metadata(subscription_id, &metadata)
            .await
        {
            Ok(()) => tracing::info!(
                subscription_id = %subscription_id,
                subject = %ctx.subject,
                user_id = %user_id,
                "Backfilled user_id into Stripe subscription metadata"
            ),
            Err(e) => tracing::warn!(
                subscription_id = %subscription_id,
                user_id = %user_id,
                error = %e,
                "Failed to backfill user_id into Stripe subscription metadata"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PaymentResult {
    Succeeded,
    Failed,
}

impl PaymentResult {
    fn as_str(&self) -> &'static str {
        match self {
            PaymentResult::Succeeded => "succeeded",
            PaymentResult::Failed => "failed",
        }
    }

    fn event_type(&self) -> &'static str {
        match self {
            PaymentResult::Succeeded => PAYMENT_SUCCEEDED,
            PaymentResult::Failed => PAYMENT_FAILED,
        }
    }
}

fn subscription_context(subscription: &SubscriptionSnapshot) -> ResolutionContext<'_> {
    ResolutionContext {
        subject: &subscription.id,
        metadata: Some(&subscription.metadata),
        customer_id: subscription.customer.as_deref(),
        ..Default::default()
    }
}

fn outcome_to_webhook(subscription_id: &str, outcome: ApplyOutcome) -> WebhookOutcome {
    match outcome {
        ApplyOutcome::Applied(record) => WebhookOutcome::Processed(format!(
            "Subscription {} synced with status {}",
            record.billing_subscription_id, record.status
        )),
        ApplyOutcome::SkippedStale { last_event_at } => WebhookOutcome::Ignored(format!(
            "Stale event for subscription {} (last applied event at {})",
            subscription_id, last_event_at
        )),
        ApplyOutcome::NotFound => {
            WebhookOutcome::Ignored(format!("No local record for subscription {}", subscription_id))
        }
        ApplyOutcome::Retired(record) => WebhookOutcome::Ignored(format!(
            "Subscription {} is {}; status left unchanged",
            record.billing_subscription_id, record.status
        )),
    }
}
