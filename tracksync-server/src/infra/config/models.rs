use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use tracksync_core::{
    DailySchedule, IgnoreFilter, NotificationRoute, PropagationConfig, ReconcilerConfig,
    TriggerPolicy,
};
use tracksync_model::UserId;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub plex: PlexConfig,
    pub server: ServerConfig,
    pub propagation: PropagationConfig,
    pub triggers: TriggerPolicy,
    pub ignore: IgnoreConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationsConfig,
    pub data_dir: PathBuf,
    pub debug: bool,
    /// Wait before the first connection attempt, for stacks where the
    /// media server container starts alongside this one.
    pub startup_delay: Duration,
    /// How often a dirty cache is written to disk.
    pub snapshot_interval: Duration,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Root of the on-disk cache snapshot store.
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.cache_dir())
    }

    pub fn ignore_filter(&self) -> IgnoreFilter {
        IgnoreFilter::new(&self.ignore.labels, &self.ignore.libraries)
    }

    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.debug {
            "debug,hyper=info,reqwest=info,tower_http=info"
        } else {
            "info,tower_http=warn"
        }
    }
}

#[derive(Clone)]
pub struct PlexConfig {
    pub url: Url,
    pub token: String,
    /// Account id of the token owner. Plex numbers the server owner `1`.
    pub owner_id: UserId,
    pub owner_name: Option<String>,
    /// Managed or shared users, keyed by account id. A configured token
    /// takes precedence over a discovered one.
    pub users: BTreeMap<UserId, PlexUser>,
    pub discover_users: bool,
    /// plex.tv endpoint used for user discovery.
    pub accounts_url: Url,
    /// How long a discovered user list is reused.
    pub users_refresh: Duration,
    pub connect_attempts: u32,
    pub connect_retry: Duration,
    pub request_timeout: Duration,
}

impl fmt::Debug for PlexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlexConfig")
            .field("url", &mask_secret(self.url.as_str()))
            .field("token", &mask_secret(&self.token))
            .field("owner_id", &self.owner_id)
            .field("users", &self.users)
            .field("discover_users", &self.discover_users)
            .field("accounts_url", &self.accounts_url.as_str())
            .field("users_refresh", &self.users_refresh)
            .field("connect_attempts", &self.connect_attempts)
            .field("connect_retry", &self.connect_retry)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct PlexUser {
    pub token: Option<String>,
    pub name: Option<String>,
}

impl fmt::Debug for PlexUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlexUser")
            .field("token", &self.token.as_deref().map(mask_secret))
            .field("name", &self.name)
            .finish()
    }
}

impl PlexConfig {
    /// Tokens configured by hand, keyed by account id.
    pub fn user_tokens(&self) -> HashMap<UserId, String> {
        self.users
            .iter()
            .filter_map(|(id, user)| user.token.clone().map(|token| (id.clone(), token)))
            .collect()
    }

    /// Display names known from configuration, used in notifications.
    pub fn user_names(&self) -> BTreeMap<UserId, String> {
        let mut names: BTreeMap<UserId, String> = self
            .users
            .iter()
            .filter_map(|(id, user)| user.name.clone().map(|name| (id.clone(), name)))
            .collect();
        if let Some(owner) = &self.owner_name {
            names.insert(self.owner_id.clone(), owner.clone());
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of the queue between intake and the event router.
    pub event_queue: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreConfig {
    pub labels: Vec<String>,
    pub libraries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub enable: bool,
    pub schedule: DailySchedule,
    pub reconciler: ReconcilerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationsConfig {
    pub enable: bool,
    pub routes: Vec<NotificationRoute>,
}

impl NotificationsConfig {
    pub fn is_active(&self) -> bool {
        self.enable && !self.routes.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
    pub token_source: SecretSource,
}

/// Where the Plex token was read from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecretSource {
    #[default]
    Missing,
    Env,
    File(PathBuf),
    Config,
}

impl SecretSource {
    pub fn describe(&self) -> String {
        match self {
            SecretSource::Missing => "missing".into(),
            SecretSource::Env => "environment".into(),
            SecretSource::File(path) => format!("secret file {}", path.display()),
            SecretSource::Config => "config file".into(),
        }
    }

    pub fn file(path: &Path) -> Self {
        SecretSource::File(path.to_path_buf())
    }
}

/// Keeps the first four characters and stars out the rest.
pub fn mask_secret(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    let hidden = value.chars().count().saturating_sub(4);
    format!("{visible}{}", "*".repeat(hidden))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_a_short_prefix() {
        assert_eq!(mask_secret("abcdefgh"), "abcd****");
        assert_eq!(mask_secret("ab"), "ab");
        assert_eq!(mask_secret(""), "");
    }
}
