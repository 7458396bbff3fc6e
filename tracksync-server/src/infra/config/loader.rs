use once_cell::sync::Lazy;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

use tracksync_core::{
    DailySchedule, NotificationRoute, PropagationConfig, ReconcilerConfig, TriggerPolicy,
};
use tracksync_model::{UpdateLevel, UpdateStrategy, UserId};

use super::{
    models::{
        Config, ConfigMetadata, IgnoreConfig, NotificationsConfig, PlexConfig, PlexUser,
        SchedulerConfig, SecretSource, ServerConfig,
    },
    sources::{EnvConfig, FileConfig, FilePlexConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("tracksync.toml"),
        PathBuf::from("config/tracksync.toml"),
    ]
});

const DEFAULT_PLEX_TOKEN_FILE: &str = "/run/secrets/plex_token";
const DEFAULT_PLEX_URL_FILE: &str = "/run/secrets/plex_url";
const DEFAULT_SCHEDULE_TIME: &str = "02:00";
const DEFAULT_PORT: u16 = 9880;
const DEFAULT_ACCOUNTS_URL: &str = "https://plex.tv";

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Loads `.env`, the process environment and the config file.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path)
                .map(|_| true)
                .or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Same as [`ConfigLoader::load`] with an explicit set of environment
    /// overrides and no `.env` handling.
    pub fn load_with_env(&self, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path, config_present) = self.load_file_config(&env)?;
        let (config, warnings) =
            self.compose_config(file_config, env, config_path, config_present)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>, bool), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env_config.config_path {
            source.env = Some(from_env.clone());
        }

        if source.is_empty() {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned();
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, None, false));
        };

        if !path.exists() {
            if provenance.is_explicit() {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None, false));
        }

        let contents = fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
            path: path.clone(),
            source: err,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path), true))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        config_present: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if !config_present {
            warnings.push_with_hint(
                "No tracksync.toml detected; falling back to environment variables",
                "Pass --config or set TRACKSYNC_CONFIG to use a configuration file",
            );
        }

        let FileConfig {
            plex: file_plex,
            server: file_server,
            update_level: file_update_level,
            update_strategy: file_update_strategy,
            trigger_on_play: file_trigger_on_play,
            trigger_on_scan: file_trigger_on_scan,
            trigger_on_activity: file_trigger_on_activity,
            refresh_library_on_scan: file_refresh_library_on_scan,
            ignore_labels: file_ignore_labels,
            ignore_libraries: file_ignore_libraries,
            scheduler: file_scheduler,
            notifications: file_notifications,
            propagation: file_propagation,
            data_dir: file_data_dir,
            debug: file_debug,
            startup_delay_secs: file_startup_delay,
            snapshot_interval_secs: file_snapshot_interval,
        } = file_config.unwrap_or_default();

        let (plex, token_source) = self.resolve_plex(&env, file_plex)?;

        let server = ServerConfig {
            host: env
                .server_host
                .clone()
                .or(file_server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.server_port.or(file_server.port).unwrap_or(DEFAULT_PORT),
            event_queue: file_server.event_queue.unwrap_or(256),
        };

        let mut propagation = file_propagation.unwrap_or_default();
        if let Some(raw) = env.update_level.clone().or(file_update_level) {
            propagation.update_level = parse_update_level(&raw)?;
        }
        if let Some(raw) = env.update_strategy.clone().or(file_update_strategy) {
            propagation.update_strategy = parse_update_strategy(&raw)?;
        }

        let default_triggers = TriggerPolicy::default();
        let triggers = TriggerPolicy {
            trigger_on_play: env
                .trigger_on_play
                .or(file_trigger_on_play)
                .unwrap_or(default_triggers.trigger_on_play),
            trigger_on_scan: env
                .trigger_on_scan
                .or(file_trigger_on_scan)
                .unwrap_or(default_triggers.trigger_on_scan),
            trigger_on_activity: env
                .trigger_on_activity
                .or(file_trigger_on_activity)
                .unwrap_or(default_triggers.trigger_on_activity),
            refresh_library_on_scan: env
                .refresh_library_on_scan
                .or(file_refresh_library_on_scan)
                .unwrap_or(default_triggers.refresh_library_on_scan),
        };

        let ignore = IgnoreConfig {
            labels: env
                .ignore_labels
                .clone()
                .or_else(|| file_ignore_labels.map(|list| list.into_vec()))
                .unwrap_or_default(),
            libraries: env
                .ignore_libraries
                .clone()
                .or_else(|| file_ignore_libraries.map(|list| list.into_vec()))
                .unwrap_or_default(),
        };

        let scheduler_enable = env
            .scheduler_enable
            .or(file_scheduler.enable)
            .unwrap_or(true);
        let schedule_time = env
            .scheduler_schedule_time
            .clone()
            .or(file_scheduler.schedule_time)
            .unwrap_or_else(|| DEFAULT_SCHEDULE_TIME.to_string());
        let schedule = match schedule_time.parse::<DailySchedule>() {
            Ok(schedule) => schedule,
            Err(_) if scheduler_enable => {
                return Err(ConfigGuardRailError::InvalidScheduleTime {
                    value: schedule_time,
                }
                .into());
            }
            Err(_) => {
                warnings.push(format!(
                    "ignoring invalid schedule_time `{schedule_time}` while the scheduler is disabled"
                ));
                DEFAULT_SCHEDULE_TIME
                    .parse()
                    .map_err(|_| ConfigGuardRailError::InvalidScheduleTime {
                        value: DEFAULT_SCHEDULE_TIME.to_string(),
                    })?
            }
        };
        let default_reconciler = ReconcilerConfig::default();
        let scheduler = SchedulerConfig {
            enable: scheduler_enable,
            schedule,
            reconciler: ReconcilerConfig {
                lookback_hours: file_scheduler
                    .lookback_hours
                    .unwrap_or(default_reconciler.lookback_hours),
                ingest_history: file_scheduler
                    .ingest_history
                    .unwrap_or(default_reconciler.ingest_history),
            },
        };

        let mut routes = file_notifications.routes;
        let global_urls = env
            .notifications_urls
            .clone()
            .unwrap_or(file_notifications.urls);
        if !global_urls.is_empty() {
            routes.insert(0, NotificationRoute::global(global_urls));
        }
        let notifications = NotificationsConfig {
            enable: env
                .notifications_enable
                .or(file_notifications.enable)
                .unwrap_or(false),
            routes,
        };

        let data_dir = env
            .data_dir
            .clone()
            .or(file_data_dir)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let config = Config {
            plex,
            server,
            propagation,
            triggers,
            ignore,
            scheduler,
            notifications,
            data_dir,
            debug: env.debug.or(file_debug).unwrap_or(false),
            startup_delay: Duration::from_secs(
                env.startup_delay_secs.or(file_startup_delay).unwrap_or(0),
            ),
            snapshot_interval: Duration::from_secs(file_snapshot_interval.unwrap_or(300).max(1)),
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded: false,
                token_source,
            },
        };

        config
            .ensure_directories()
            .map_err(|source| ConfigLoadError::Filesystem {
                path: config.cache_dir(),
                source,
            })?;

        let guard_warnings = validation::apply_guard_rails(&config)?;
        warnings.extend(guard_warnings);

        Ok((config, warnings))
    }

    fn resolve_plex(
        &self,
        env: &EnvConfig,
        file: FilePlexConfig,
    ) -> Result<(PlexConfig, SecretSource), ConfigLoadError> {
        let (url, _) = resolve_secret(
            env.plex_url.as_ref(),
            env.plex_url_file.as_deref(),
            Path::new(DEFAULT_PLEX_URL_FILE),
            file.url.as_ref(),
        )?;
        let url = url.ok_or(ConfigGuardRailError::MissingPlexUrl)?;
        let url = parse_plex_url(&url)?;

        let (token, token_source) = resolve_secret(
            env.plex_token.as_ref(),
            env.plex_token_file.as_deref(),
            Path::new(DEFAULT_PLEX_TOKEN_FILE),
            file.token.as_ref(),
        )?;
        let token = token.ok_or(ConfigGuardRailError::MissingPlexToken)?;

        let users: BTreeMap<UserId, PlexUser> = file
            .users
            .into_iter()
            .filter(|(id, _)| !id.trim().is_empty())
            .map(|(id, user)| {
                (
                    UserId::new(id.trim()),
                    PlexUser {
                        token: user.token.map(|token| token.trim().to_string()),
                        name: user.name,
                    },
                )
            })
            .collect();

        let plex = PlexConfig {
            url,
            token,
            owner_id: file
                .owner_id
                .filter(|id| !id.trim().is_empty())
                .map(|id| UserId::new(id.trim()))
                .unwrap_or_else(|| UserId::new("1")),
            owner_name: file.owner_name,
            users,
            discover_users: env
                .plex_discover_users
                .or(file.discover_users)
                .unwrap_or(true),
            accounts_url: match file.accounts_url {
                Some(raw) => parse_plex_url(&raw)?,
                None => Url::parse(DEFAULT_ACCOUNTS_URL).map_err(|err| {
                    ConfigGuardRailError::InvalidPlexUrl {
                        value: DEFAULT_ACCOUNTS_URL.to_string(),
                        reason: err.to_string(),
                    }
                })?,
            },
            users_refresh: Duration::from_secs(
                file.users_refresh_hours.unwrap_or(12).max(1) * 3600,
            ),
            connect_attempts: file.connect_attempts.unwrap_or(5),
            connect_retry: Duration::from_secs(file.connect_retry_secs.unwrap_or(10)),
            request_timeout: Duration::from_secs(file.request_timeout_secs.unwrap_or(30).max(1)),
        };
        Ok((plex, token_source))
    }
}

/// Environment value, then secret file, then config file.
///
/// An explicitly named secret file must be readable; the default Docker
/// secret location is only used when present.
fn resolve_secret(
    env_value: Option<&String>,
    env_file: Option<&Path>,
    default_file: &Path,
    file_value: Option<&String>,
) -> Result<(Option<String>, SecretSource), ConfigLoadError> {
    if let Some(value) = env_value.filter(|value| !value.trim().is_empty()) {
        return Ok((Some(value.trim().to_string()), SecretSource::Env));
    }

    match env_file {
        Some(path) => {
            if let Some(secret) = read_secret_file(path)? {
                return Ok((Some(secret), SecretSource::file(path)));
            }
        }
        None if default_file.exists() => {
            if let Some(secret) = read_secret_file(default_file)? {
                return Ok((Some(secret), SecretSource::file(default_file)));
            }
        }
        None => {}
    }

    if let Some(value) = file_value.filter(|value| !value.trim().is_empty()) {
        return Ok((Some(value.trim().to_string()), SecretSource::Config));
    }

    Ok((None, SecretSource::Missing))
}

/// First line of the file, trimmed. Empty files count as unset.
fn read_secret_file(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::SecretFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    let first = contents.lines().next().unwrap_or_default().trim();
    if first.is_empty() {
        Ok(None)
    } else {
        Ok(Some(first.to_string()))
    }
}

fn parse_plex_url(raw: &str) -> Result<Url, ConfigGuardRailError> {
    let invalid = |reason: String| ConfigGuardRailError::InvalidPlexUrl {
        value: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|err| invalid(err.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(url)
}

fn parse_update_level(raw: &str) -> Result<UpdateLevel, ConfigGuardRailError> {
    raw.parse()
        .map_err(|_| ConfigGuardRailError::InvalidPolicy {
            field: "update_level",
            value: raw.to_string(),
            expected: "`show` or `season`",
        })
}

fn parse_update_strategy(raw: &str) -> Result<UpdateStrategy, ConfigGuardRailError> {
    raw.parse()
        .map_err(|_| ConfigGuardRailError::InvalidPolicy {
            field: "update_strategy",
            value: raw.to_string(),
            expected: "`all` or `next`",
        })
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to read secret file {path}")]
    SecretFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create data directory {path}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn is_empty(&self) -> bool {
        self.explicit.is_none() && self.env.is_none() && self.default.is_none()
    }

    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}

impl ConfigPathProvenance {
    fn is_explicit(self) -> bool {
        matches!(self, ConfigPathProvenance::Explicit | ConfigPathProvenance::Env)
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
