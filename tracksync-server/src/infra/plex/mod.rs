//! Plex Media Server transport.

pub mod accounts;
pub mod client;
pub mod payloads;

pub use client::PlexClient;
pub use payloads::WebhookPayload;
