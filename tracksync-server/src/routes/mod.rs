pub mod v1;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{health, webhook};
use crate::infra::app_state::AppState;

/// Create the API router with all versions
pub fn create_api_router() -> Router<AppState> {
    Router::new().nest("/api/v1", v1::create_v1_router())
}

/// Full application: health checks, the Plex webhook and the versioned API.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/health", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/ready", get(health::readyz))
        .route("/webhooks/plex", post(webhook::plex_webhook))
        .merge(create_api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
