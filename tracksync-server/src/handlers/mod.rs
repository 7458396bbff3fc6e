//! HTTP intake for push events and the health surface.

pub mod events;
pub mod health;
pub mod webhook;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use tracksync_core::InboundEvent;

use crate::infra::app_state::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntakeResponse {
    pub accepted: bool,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IntakeResponse {
    fn accepted(event: &str) -> Self {
        Self {
            accepted: true,
            event: event.to_string(),
            reason: None,
        }
    }

    fn rejected(event: &str, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            event: event.to_string(),
            reason: Some(reason.into()),
        }
    }
}

/// Error body for requests that could not be parsed.
pub(crate) fn bad_request(reason: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(IntakeResponse::rejected("unknown", reason)),
    )
        .into_response()
}

/// Queues an event for the router.
///
/// Events for disabled triggers are answered without being queued. A
/// playback event without tracks gets them read from the media server here,
/// so the selection reflects the moment of the play.
pub(crate) async fn intake(state: &AppState, mut event: InboundEvent) -> Response {
    let kind = event.kind();
    if !state.router.accepts(&event) {
        debug!(target: "tracksync::intake", event = kind, "trigger disabled, event skipped");
        return (
            StatusCode::OK,
            Json(IntakeResponse::rejected(kind, "trigger disabled")),
        )
            .into_response();
    }

    observe_tracks(state, &mut event).await;

    match state.events.try_send(event) {
        Ok(()) => {
            debug!(target: "tracksync::intake", event = kind, "event queued");
            (StatusCode::ACCEPTED, Json(IntakeResponse::accepted(kind))).into_response()
        }
        Err(TrySendError::Full(_)) => {
            warn!(target: "tracksync::intake", event = kind, "event queue full, event dropped");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(IntakeResponse::rejected(kind, "event queue full")),
            )
                .into_response()
        }
        Err(TrySendError::Closed(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(IntakeResponse::rejected(kind, "shutting down")),
        )
            .into_response(),
    }
}

async fn observe_tracks(state: &AppState, event: &mut InboundEvent) {
    let playback = match event {
        InboundEvent::Played(playback) | InboundEvent::ActivityChanged(playback) => playback,
        InboundEvent::Scanned(_) => return,
    };
    if playback.tracks.is_some() {
        return;
    }
    let observed = state
        .client
        .get_track_selection(&playback.episode_id, &playback.user_id)
        .await;
    match observed {
        Ok(tracks) if tracks.audio.is_some() => playback.tracks = Some(tracks),
        Ok(_) => {}
        Err(err) => debug!(
            target: "tracksync::intake",
            episode = %playback.episode_id,
            user = %playback.user_id,
            error = %err,
            "selection not read at intake, router will retry"
        ),
    }
}
