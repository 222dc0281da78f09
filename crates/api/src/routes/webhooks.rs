//! Stripe webhook receiver
//!
//! Public endpoint, authenticated by the Stripe-Signature header only. The
//! body is taken as raw bytes because the signature covers the exact bytes
//! Stripe sent.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Serialize;

use crate::error::ApiResult;
use crate::state::AppState;

pub const STRIPE_SIGNATURE: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub message: String,
}

/// POST /webhooks/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers
        .get(STRIPE_SIGNATURE)
        .and_then(|v| v.to_str().ok());

    let outcome = state.webhooks.handle_delivery(&body, signature).await?;

    Ok(Json(WebhookResponse {
        received: true,
        message: outcome.message().to_string(),
    }))
}
