//! API routes

pub mod health;
pub mod webhooks;


use axum::{
    http::{header, HeaderName, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Request headers allowed on the webhook endpoint
const WEBHOOK_ALLOWED_HEADERS: [HeaderName; 5] = [
    header::AUTHORIZATION,
    HeaderName::from_static("x-client-info"),
    HeaderName::from_static("apikey"),
    header::CONTENT_TYPE,
    HeaderName::from_static(webhooks::STRIPE_SIGNATURE),
];

/// Build the router. Tracing and other outer layers are added by the binary.
pub fn create_router(state: AppState) -> Router {
    // Preflight requests are answered by the layer itself
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(WEBHOOK_ALLOWED_HEADERS);

    let webhook_routes = Router::new()
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .layer(cors);

    Router::new()
        .route("/health", get(health::health))
        .merge(webhook_routes)
        .with_state(state)
}
