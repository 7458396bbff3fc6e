use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers::{events, health};
use crate::infra::app_state::AppState;

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route("/events", post(events::post_event))
        .route("/status", get(health::status))
}
