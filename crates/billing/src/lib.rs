// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! AgencyOS Billing Module
//!
//! Reconciles Stripe subscription events into the local subscriptions table.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body with replay tolerance
//! - **Audit Log**: Every verified delivery is recorded before it is applied
//! - **User Resolution**: Metadata, client reference, then customer email
//! - **State Application**: Idempotent upserts keyed on the Stripe subscription id
//! - **Webhooks**: Subscription, checkout and invoice events

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod objects;
pub mod postgres;
pub mod provider;
pub mod resolver;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::{BillingMode, ReconcilerConfig, StaleEventPolicy};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    BillingEvent, BillingEventBuilder, BillingEventLogger, DeliveryOutcome, NewBillingEvent,
    NewDeliveryOutcome, ProcessingResult,
};

// Objects
pub use objects::{Metadata, WebhookEvent};

// Persistence
pub use postgres::{PgEventStore, PgSubscriptionStore, PgUserDirectory};
pub use store::{EventStore, SubscriptionStore, UserDirectory};

// Provider
pub use provider::BillingProvider;

// Resolution
pub use resolver::{MetadataSource, Resolution, ResolutionContext, ResolutionStrategy, UserResolver};

// Signature
pub use signature::{sign_payload, SignatureVerifier};

// Subscriptions
pub use subscriptions::{ApplyOutcome, SubscriptionApplier, SubscriptionPatch, SubscriptionRecord};

// Webhooks
pub use webhooks::{WebhookDependencies, WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Billing service wired against Postgres and the live Stripe API
pub struct BillingService {
    pub stripe: StripeClient,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(
            StripeConfig::from_env()?,
            &ReconcilerConfig::from_env()?,
            pool,
        ))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, reconciler: &ReconcilerConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        let webhook_secret = stripe.config().webhook_secret.clone();

        let deps = WebhookDependencies {
            provider: Arc::new(stripe.clone()),
            subscriptions: Arc::new(PgSubscriptionStore::new(pool.clone())),
            events: Arc::new(PgEventStore::new(pool.clone())),
            users: Arc::new(PgUserDirectory::new(pool)),
        };

        Self {
            webhooks: WebhookHandler::new(webhook_secret, reconciler, deps),
            stripe,
        }
    }
}
