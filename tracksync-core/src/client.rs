//! Boundary to the media server.
//!
//! The cache only ever learns about the library through these listings, and
//! the propagation engine only ever writes through `set_track_selection`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tracksync_model::{
    EpisodeId, LibraryId, PartId, SeasonId, SequencePosition, ShowId, TrackId, UserId,
};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryListing {
    pub id: LibraryId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowListing {
    pub id: ShowId,
    pub title: String,
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonListing {
    pub id: SeasonId,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeListing {
    pub id: EpisodeId,
    pub title: String,
    pub position: SequencePosition,
    pub parts: Vec<PartId>,
}

/// Tracks currently selected on one episode for one user, as reported by the
/// server. `audio` is `None` when the file has no audio stream selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedTracks {
    pub audio: Option<TrackId>,
    pub subtitle: Option<TrackId>,
}

/// Playback history entry used by the reconciler to catch missed plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub user_id: UserId,
    pub episode_id: EpisodeId,
    pub show_id: Option<ShowId>,
    pub viewed_at: DateTime<Utc>,
}

/// Operations tracksync needs from the media server.
///
/// Implementations map their failures onto [`crate::SyncError`]: network and
/// 5xx failures become `Transient`, deleted entities become `NotFound`.
#[async_trait]
pub trait MediaServerClient: Send + Sync {
    async fn list_libraries(&self) -> Result<Vec<LibraryListing>>;

    async fn list_shows(&self, library: &LibraryId) -> Result<Vec<ShowListing>>;

    async fn list_seasons(&self, show: &ShowId) -> Result<Vec<SeasonListing>>;

    async fn list_episodes(&self, season: &SeasonId) -> Result<Vec<EpisodeListing>>;

    async fn get_track_selection(
        &self,
        episode: &EpisodeId,
        user: &UserId,
    ) -> Result<SelectedTracks>;

    async fn set_track_selection(
        &self,
        episode: &EpisodeId,
        user: &UserId,
        audio: &TrackId,
        subtitle: Option<&TrackId>,
    ) -> Result<()>;

    /// Episodes watched since `since`. Servers without a history API return
    /// nothing and the reconciler relies on cached observations alone.
    async fn history_since(&self, _since: DateTime<Utc>) -> Result<Vec<HistoryEntry>> {
        Ok(Vec::new())
    }
}
