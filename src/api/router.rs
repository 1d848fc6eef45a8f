//! API router.
//!
//! Layer stack (outermost -> innermost): trace -> CORS -> body limit -> handler.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;

/// Request body ceiling: base64 of a maximum-size image plus the envelope.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Build the service router over a shared engine slot.
pub fn api_router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/predict", post(endpoints::predict::predict))
        .route("/health", get(endpoints::health::check))
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
