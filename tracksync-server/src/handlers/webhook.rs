use axum::{
    extract::{Multipart, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::debug;

use super::{IntakeResponse, bad_request, intake};
use crate::infra::app_state::AppState;
use crate::infra::plex::WebhookPayload;

/// `POST /webhooks/plex`: Plex sends a multipart form whose `payload` field
/// holds the JSON event. A thumbnail part may follow and is ignored.
pub async fn plex_webhook(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let payload = match read_payload(&mut multipart).await {
        Ok(Some(payload)) => payload,
        Ok(None) => return bad_request("missing payload field"),
        Err(err) => return bad_request(err.body_text()),
    };

    let webhook: WebhookPayload = match serde_json::from_str(&payload) {
        Ok(webhook) => webhook,
        Err(err) => return bad_request(format!("invalid webhook payload: {err}")),
    };

    let name = webhook.event.clone();
    match webhook.into_event() {
        Some(event) => intake(&state, event).await,
        None => {
            debug!(target: "tracksync::intake", event = %name, "webhook ignored");
            (
                StatusCode::OK,
                Json(IntakeResponse::rejected(&name, "not handled")),
            )
                .into_response()
        }
    }
}

async fn read_payload(multipart: &mut Multipart) -> Result<Option<String>, MultipartError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("payload") {
            return field.text().await.map(Some);
        }
    }
    Ok(None)
}
