use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use tracksync_core::{NotificationRoute, PropagationConfig};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub plex: FilePlexConfig,
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_on_play: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_on_scan: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_on_activity: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_library_on_scan: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_labels: Option<StringList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_libraries: Option<StringList>,
    #[serde(default)]
    pub scheduler: FileSchedulerConfig,
    #[serde(default)]
    pub notifications: FileNotificationsConfig,
    /// Concurrency and pacing of update calls. `update_level` and
    /// `update_strategy` are taken from the top level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation: Option<PropagationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_delay_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_interval_secs: Option<u64>,
}

/// Either a TOML array or a single comma separated string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StringList {
    List(Vec<String>),
    Csv(String),
}

impl StringList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringList::List(values) => clean_list(values),
            StringList::Csv(raw) => split_csv(&raw),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePlexConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub users: BTreeMap<String, FilePlexUser>,
    /// Look up shared and managed users (and their tokens) on plex.tv.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discover_users: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accounts_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users_refresh_hours: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_retry_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilePlexUser {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_queue: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSchedulerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<String>,
    /// How far back the daily pass looks for plays and observations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookback_hours: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest_history: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileNotificationsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// Targets notified of every change, for every user.
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub routes: Vec<NotificationRoute>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub plex_url: Option<String>,
    pub plex_url_file: Option<PathBuf>,
    pub plex_token: Option<String>,
    pub plex_token_file: Option<PathBuf>,
    pub plex_discover_users: Option<bool>,
    pub update_level: Option<String>,
    pub update_strategy: Option<String>,
    pub trigger_on_play: Option<bool>,
    pub trigger_on_scan: Option<bool>,
    pub trigger_on_activity: Option<bool>,
    pub refresh_library_on_scan: Option<bool>,
    pub ignore_labels: Option<Vec<String>>,
    pub ignore_libraries: Option<Vec<String>>,
    pub scheduler_enable: Option<bool>,
    pub scheduler_schedule_time: Option<String>,
    pub notifications_enable: Option<bool>,
    pub notifications_urls: Option<Vec<String>>,
    pub data_dir: Option<PathBuf>,
    pub debug: Option<bool>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub startup_delay_secs: Option<u64>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the overrides from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env_config = Self::default();

        env_config.config_path = lookup("TRACKSYNC_CONFIG").map(PathBuf::from);
        env_config.plex_url = lookup("PLEX_URL");
        env_config.plex_url_file = lookup("PLEX_URL_FILE").map(PathBuf::from);
        env_config.plex_token = lookup("PLEX_TOKEN");
        env_config.plex_token_file = lookup("PLEX_TOKEN_FILE").map(PathBuf::from);
        env_config.plex_discover_users = parse_bool_var(&lookup, "PLEX_DISCOVER_USERS");

        env_config.update_level = lookup("UPDATE_LEVEL");
        env_config.update_strategy = lookup("UPDATE_STRATEGY");
        env_config.trigger_on_play = parse_bool_var(&lookup, "TRIGGER_ON_PLAY");
        env_config.trigger_on_scan = parse_bool_var(&lookup, "TRIGGER_ON_SCAN");
        env_config.trigger_on_activity = parse_bool_var(&lookup, "TRIGGER_ON_ACTIVITY");
        env_config.refresh_library_on_scan = parse_bool_var(&lookup, "REFRESH_LIBRARY_ON_SCAN");
        env_config.ignore_labels = lookup("IGNORE_LABELS").map(|raw| split_csv(&raw));
        env_config.ignore_libraries = lookup("IGNORE_LIBRARIES").map(|raw| split_csv(&raw));

        env_config.scheduler_enable = parse_bool_var(&lookup, "SCHEDULER_ENABLE");
        env_config.scheduler_schedule_time = lookup("SCHEDULER_SCHEDULE_TIME");

        env_config.notifications_enable = parse_bool_var(&lookup, "NOTIFICATIONS_ENABLE");
        env_config.notifications_urls = lookup("NOTIFICATIONS_URLS").map(|raw| split_csv(&raw));

        env_config.data_dir = lookup("DATA_DIR").map(PathBuf::from);
        env_config.debug = parse_bool_var(&lookup, "DEBUG");
        env_config.server_host = lookup("SERVER_HOST");
        env_config.server_port = lookup("SERVER_PORT").and_then(|s| s.parse().ok());
        env_config.startup_delay_secs =
            lookup("STARTUP_DELAY_SECS").and_then(|s| s.trim().parse().ok());

        env_config
    }
}

pub(crate) fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn clean_list(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn parse_bool_var<F>(lookup: &F, name: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).and_then(|raw| match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}
