//! Configuration loading: TOML file, `.env`, environment overrides and
//! Docker secret files, composed into one validated [`Config`].

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    Config, ConfigMetadata, IgnoreConfig, NotificationsConfig, PlexConfig, PlexUser,
    SchedulerConfig, SecretSource, ServerConfig, mask_secret,
};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
