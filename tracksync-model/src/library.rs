//! Library → Show → Season → Episode hierarchy as held by the cache.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::ids::{EpisodeId, LibraryId, PartId, SeasonId, ShowId, UserId};
use crate::selection::TrackSelection;

/// Position of an episode inside its show. The derived ordering (season
/// first, then episode) is the only order "next" is defined against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SequencePosition {
    pub season: u32,
    pub episode: u32,
}

impl SequencePosition {
    pub const fn new(season: u32, episode: u32) -> Self {
        Self { season, episode }
    }
}

impl fmt::Display for SequencePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{:02}E{:02}", self.season, self.episode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Library {
    pub id: LibraryId,
    pub name: String,
    pub ignored: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Show {
    pub id: ShowId,
    pub library_id: LibraryId,
    pub title: String,
    pub labels: BTreeSet<String>,
    /// Set when a label or the owning library is on an ignore list.
    pub ignored: bool,
    /// Ordered by season index.
    pub seasons: Vec<Season>,
}

impl Show {
    pub fn episodes(&self) -> impl Iterator<Item = &Episode> {
        self.seasons.iter().flat_map(|season| season.episodes.iter())
    }

    pub fn episode(&self, id: &EpisodeId) -> Option<&Episode> {
        self.episodes().find(|episode| &episode.id == id)
    }

    pub fn episode_mut(&mut self, id: &EpisodeId) -> Option<&mut Episode> {
        self.seasons
            .iter_mut()
            .flat_map(|season| season.episodes.iter_mut())
            .find(|episode| &episode.id == id)
    }

    pub fn season_of(&self, id: &EpisodeId) -> Option<&Season> {
        self.seasons
            .iter()
            .find(|season| season.episodes.iter().any(|e| &e.id == id))
    }

    pub fn episode_count(&self) -> usize {
        self.seasons.iter().map(|season| season.episodes.len()).sum()
    }

    /// Users holding at least one selection anywhere in the show.
    pub fn users(&self) -> BTreeSet<UserId> {
        self.episodes()
            .flat_map(|episode| episode.selections.keys().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Season {
    pub id: SeasonId,
    pub show_id: ShowId,
    pub index: u32,
    /// Ordered by episode index.
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Episode {
    pub id: EpisodeId,
    pub season_id: SeasonId,
    pub title: String,
    pub position: SequencePosition,
    #[cfg_attr(feature = "serde", serde(default))]
    pub parts: Vec<PartId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub selections: HashMap<UserId, TrackSelection>,
}

impl Episode {
    pub fn selection_for(&self, user: &UserId) -> Option<&TrackSelection> {
        self.selections.get(user)
    }
}
