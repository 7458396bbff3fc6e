use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or server-side failure talking to the media server. Retryable.
    #[error("media server unavailable: {0}")]
    Transient(String),

    /// The entity no longer exists upstream. Callers prune it from the cache.
    #[error("not found on media server: {0}")]
    NotFound(String),

    /// The target episode has no track matching the requested selection.
    #[error("track unavailable: {0}")]
    TrackUnavailable(String),

    #[error("no credentials for user {0}")]
    UnknownUser(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{failed} of {total} target episode(s) failed to update")]
    PartialBatch { failed: usize, total: usize },

    #[error("cache storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    /// Whether the reconciler should try the same operation again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient(_) | SyncError::PartialBatch { .. } | SyncError::Cancelled(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<tracksync_model::ModelError> for SyncError {
    fn from(err: tracksync_model::ModelError) -> Self {
        SyncError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
