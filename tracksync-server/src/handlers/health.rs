use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::infra::app_state::AppState;

/// Liveness as seen by the media server: healthy while the library listing
/// endpoint answers.
pub async fn healthz(State(state): State<AppState>) -> Response {
    match state.client.list_libraries().await {
        Ok(libraries) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "media_server": "reachable",
                "libraries": libraries.len(),
            })),
        )
            .into_response(),
        Err(err) => {
            warn!(target: "tracksync::health", error = %err, "media server health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "media_server": "unreachable",
                    "error": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// Ready once the startup refresh has run.
pub async fn readyz(State(state): State<AppState>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "starting" })),
        )
            .into_response()
    }
}

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.config();
    let summary = state.cache.summary().await;
    let uptime = (Utc::now() - state.started_at).to_std().unwrap_or_default();
    let uptime = std::time::Duration::from_secs(uptime.as_secs());

    let scheduler = if config.scheduler.enable {
        let wait = std::time::Duration::from_secs(config.scheduler.schedule.until_next().as_secs());
        json!({
            "enabled": true,
            "schedule_time": config.scheduler.schedule.to_string(),
            "next_run_in": humantime::format_duration(wait).to_string(),
            "lookback_hours": config.scheduler.reconciler.lookback_hours,
            "ingest_history": config.scheduler.reconciler.ingest_history,
        })
    } else {
        json!({ "enabled": false })
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "ready": state.is_ready(),
        "started_at": state.started_at.to_rfc3339(),
        "uptime": humantime::format_duration(uptime).to_string(),
        "cache": summary,
        "triggers": state.router.policy(),
        "propagation": config.propagation,
        "scheduler": scheduler,
        "notifications": {
            "enabled": config.notifications.is_active(),
            "routes": config.notifications.routes.len(),
        },
    }))
}
