//! Billing error types

use thiserror::Error;

/// Result type for billing operations
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced while reconciling Stripe webhook deliveries.
///
/// Variants split into two groups. Client errors (bad signature, bad payload,
/// unresolvable user) are answered with 400 so Stripe stops redelivering;
/// everything else is answered with 500 so Stripe's retry schedule kicks in.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Missing Stripe-Signature header")]
    WebhookSignatureMissing,

    #[error("Invalid webhook signature: {0}")]
    WebhookSignatureInvalid(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Could not resolve a local user for {0}")]
    UserNotResolved(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// True when redelivering the same event cannot succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::WebhookSignatureMissing
                | BillingError::WebhookSignatureInvalid(_)
                | BillingError::InvalidInput(_)
                | BillingError::UserNotResolved(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}
