use axum::{
    extract::{State, rejection::JsonRejection},
    response::{Json, Response},
};

use tracksync_core::InboundEvent;

use super::{bad_request, intake};
use crate::infra::app_state::AppState;

/// `POST /api/v1/events`: JSON events from push-notification bridges.
pub async fn post_event(
    State(state): State<AppState>,
    payload: Result<Json<InboundEvent>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(event)) => intake(&state, event).await,
        Err(rejection) => bad_request(rejection.body_text()),
    }
}
