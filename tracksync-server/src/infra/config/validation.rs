use thiserror::Error;

use super::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("a Plex URL is required (PLEX_URL, PLEX_URL_FILE or plex.url)")]
    MissingPlexUrl,
    #[error("a Plex token is required (PLEX_TOKEN, PLEX_TOKEN_FILE or plex.token)")]
    MissingPlexToken,
    #[error("invalid Plex URL `{value}`: {reason}")]
    InvalidPlexUrl { value: String, reason: String },
    #[error("`{field}` must be one of {expected}, got `{value}`")]
    InvalidPolicy {
        field: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("a valid `scheduler.schedule_time` with the format HH:MM is required, got `{value}`")]
    InvalidScheduleTime { value: String },
    #[error("`{field}` must be greater than zero")]
    ZeroLimit { field: &'static str },
    #[error("user `{user}` has an empty token")]
    EmptyUserToken { user: String },
    #[error("user `{user}` has no token and user discovery is disabled")]
    MissingUserToken { user: String },
    #[error("notification route {index} has no target URL")]
    EmptyNotificationRoute { index: usize },
    #[error("invalid notification URL `{value}`")]
    InvalidNotificationUrl { value: String },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.plex.token.trim().is_empty() {
        return Err(ConfigGuardRailError::MissingPlexToken);
    }
    for (user, account) in &config.plex.users {
        match &account.token {
            Some(token) if token.trim().is_empty() => {
                return Err(ConfigGuardRailError::EmptyUserToken {
                    user: user.to_string(),
                });
            }
            None if !config.plex.discover_users => {
                return Err(ConfigGuardRailError::MissingUserToken {
                    user: user.to_string(),
                });
            }
            _ => {}
        }
    }

    enforce_limits(config)?;
    validate_notifications(config, &mut warnings)?;

    let triggers = &config.triggers;
    if triggers.trigger_on_scan && !triggers.refresh_library_on_scan {
        warnings.push_with_hint(
            "TRIGGER_ON_SCAN is enabled but REFRESH_LIBRARY_ON_SCAN is false",
            "New episodes are only picked up by the scheduled pass until REFRESH_LIBRARY_ON_SCAN is enabled",
        );
    }

    if !triggers.trigger_on_play
        && !triggers.trigger_on_activity
        && !triggers.trigger_on_scan
        && !config.scheduler.enable
    {
        warnings.push_with_hint(
            "every trigger and the scheduler are disabled; nothing will be propagated",
            "Enable TRIGGER_ON_PLAY or SCHEDULER_ENABLE",
        );
    }

    if config.plex.url.scheme() == "http"
        && let Some(host) = config.plex.url.host_str()
        && !is_local_host(host)
    {
        warnings.push_with_hint(
            format!("Plex URL uses plain http for non-local host {host}"),
            "Use the https URL of the server so the token is not sent in clear text",
        );
    }

    Ok(warnings)
}

fn enforce_limits(config: &Config) -> Result<(), ConfigGuardRailError> {
    let propagation = &config.propagation;
    if propagation.max_concurrent_updates == 0 {
        return Err(ConfigGuardRailError::ZeroLimit {
            field: "propagation.max_concurrent_updates",
        });
    }
    if propagation.batch_size == 0 {
        return Err(ConfigGuardRailError::ZeroLimit {
            field: "propagation.batch_size",
        });
    }
    if config.plex.connect_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroLimit {
            field: "plex.connect_attempts",
        });
    }
    if config.server.event_queue == 0 {
        return Err(ConfigGuardRailError::ZeroLimit {
            field: "server.event_queue",
        });
    }
    if config.scheduler.reconciler.lookback_hours == 0 {
        return Err(ConfigGuardRailError::ZeroLimit {
            field: "scheduler.lookback_hours",
        });
    }
    Ok(())
}

fn validate_notifications(
    config: &Config,
    warnings: &mut ConfigWarnings,
) -> Result<(), ConfigGuardRailError> {
    let notifications = &config.notifications;
    for (index, route) in notifications.routes.iter().enumerate() {
        if route.targets.is_empty() {
            return Err(ConfigGuardRailError::EmptyNotificationRoute { index });
        }
        for target in &route.targets {
            url::Url::parse(target).map_err(|_| ConfigGuardRailError::InvalidNotificationUrl {
                value: target.clone(),
            })?;
        }
        if config.plex.discover_users {
            continue;
        }
        for user in &route.users {
            if *user != config.plex.owner_id && !config.plex.users.contains_key(user) {
                warnings.push(format!(
                    "notification route {index} filters on user {user}, which has no configured token"
                ));
            }
        }
    }

    if notifications.enable && notifications.routes.is_empty() {
        warnings.push_with_hint(
            "notifications are enabled but no target is configured",
            "Set NOTIFICATIONS_URLS or add a [[notifications.routes]] entry",
        );
    }
    Ok(())
}

fn is_local_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".local") || host.ends_with(".lan") {
        return true;
    }
    match host.trim_matches(['[', ']']).parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(ip)) => ip.is_private() || ip.is_loopback(),
        Ok(std::net::IpAddr::V6(ip)) => ip.is_loopback(),
        Err(_) => !host.contains('.'),
    }
}
