pub mod app_state;
pub mod config;
pub mod notify;
pub mod plex;
pub mod startup;
