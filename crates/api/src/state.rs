//! Application state

use std::sync::Arc;

use agencyos_billing::{BillingService, WebhookHandler};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    /// Wire the Stripe client and Postgres stores; both are built once per process
    pub fn new(pool: PgPool, config: &Config) -> Self {
        let billing = BillingService::new(config.stripe.clone(), &config.reconciler, pool);
        tracing::info!(
            mode = %config.reconciler.mode,
            stale_event_policy = ?config.reconciler.stale_event_policy,
            "Stripe webhook reconciler initialized"
        );
        Self::with_handler(billing.webhooks)
    }

    pub fn with_handler(webhooks: WebhookHandler) -> Self {
        Self {
            webhooks: Arc::new(webhooks),
        }
    }
}
