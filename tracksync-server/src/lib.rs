//! # tracksync server
//!
//! Receives Plex webhooks and JSON events, routes them into the propagation
//! engine, runs the daily reconciler and forwards change notifications.
//!
//! ## Endpoints
//!
//! - `POST /webhooks/plex`: multipart webhook as sent by Plex
//! - `POST /api/v1/events`: JSON [`tracksync_core::InboundEvent`]
//! - `GET /api/v1/status`: cache and policy summary
//! - `GET /healthz`, `GET /readyz`: health checks

pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;
pub use routes::create_app;
