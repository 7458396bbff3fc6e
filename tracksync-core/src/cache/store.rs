use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tracksync_model::{Library, Show, ShowId, UserId};

use super::RefreshScope;
use crate::error::{Result, SyncError};

/// Key of the library snapshot inside the store. Bump the version whenever
/// the snapshot layout changes incompatibly.
pub const SNAPSHOT_KEY: &str = "library-cache/v1";

const SNAPSHOT_VERSION: u32 = 1;

/// Serialized form of the whole cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub last_refresh: Option<DateTime<Utc>>,
    pub libraries: Vec<Library>,
    pub shows: Vec<Show>,
    #[serde(default)]
    pub refresh_retries: Vec<RefreshScope>,
    #[serde(default)]
    pub propagation_retries: Vec<(ShowId, UserId)>,
}

impl CacheSnapshot {
    pub(crate) fn new(
        last_refresh: Option<DateTime<Utc>>,
        libraries: Vec<Library>,
        shows: Vec<Show>,
        refresh_retries: Vec<RefreshScope>,
        propagation_retries: Vec<(ShowId, UserId)>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            last_refresh,
            libraries,
            shows,
            refresh_retries,
            propagation_retries,
        }
    }
}

/// A thin typed wrapper over `cacache` holding the cache snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SnapshotStore").field(&self.root).finish()
    }
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads the stored snapshot. A missing entry, an unreadable entry, or
    /// one written by an incompatible version yields `None` so the caller
    /// starts from an empty cache.
    pub async fn load(&self) -> Result<Option<CacheSnapshot>> {
        let bytes = match cacache::read(&self.root, SNAPSHOT_KEY).await {
            Ok(bytes) => bytes,
            Err(cacache::Error::EntryNotFound(_, _)) => {
                debug!(root = %self.root.display(), "no cache snapshot stored");
                return Ok(None);
            }
            Err(cacache::Error::IntegrityError(err)) => {
                warn!(error = %err, "cache snapshot failed integrity check, discarding");
                self.discard().await;
                return Ok(None);
            }
            Err(cacache::Error::SizeMismatch(wanted, actual)) => {
                warn!(wanted, actual, "cache snapshot size mismatch, discarding");
                self.discard().await;
                return Ok(None);
            }
            Err(err) => {
                return Err(SyncError::Storage(format!(
                    "cacache read failed: {err}"
                )));
            }
        };

        match serde_json::from_slice::<CacheSnapshot>(&bytes) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => {
                Ok(Some(snapshot))
            }
            Ok(snapshot) => {
                warn!(
                    version = snapshot.version,
                    expected = SNAPSHOT_VERSION,
                    "cache snapshot has an unsupported version, discarding"
                );
                Ok(None)
            }
            Err(err) => {
                warn!(error = %err, "cache snapshot is corrupt, discarding");
                self.discard().await;
                Ok(None)
            }
        }
    }

    pub async fn save(&self, snapshot: &CacheSnapshot) -> Result<usize> {
        let bytes = serde_json::to_vec(snapshot)?;
        cacache::write(&self.root, SNAPSHOT_KEY, &bytes)
            .await
            .map_err(|e| SyncError::Storage(format!("cacache write failed: {e}")))?;
        Ok(bytes.len())
    }

    async fn discard(&self) {
        if let Err(err) = self.remove().await {
            warn!(error = %err, "failed to remove unreadable cache snapshot");
        }
    }

    pub async fn remove(&self) -> Result<()> {
        cacache::index::RemoveOpts::new()
            .remove_fully(true)
            .remove(&self.root, SNAPSHOT_KEY)
            .await
            .map_err(|e| SyncError::Storage(format!("cacache remove failed: {e}")))
    }
}
