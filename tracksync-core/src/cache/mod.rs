//! In-memory mirror of the media server library.
//!
//! Each show lives behind its own async mutex so refreshes and propagations
//! of different shows never contend. The episode and library indexes are
//! concurrent maps; they only hold ids and are rebuilt from the show nodes
//! on load.

mod filter;
mod refresh;
pub mod store;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use tracksync_model::{
    Episode, EpisodeId, Library, LibraryId, Season, SeasonId, ShowId, Show, TrackSelection,
    UserId,
};

use crate::client::{EpisodeListing, SeasonListing};
use crate::error::{Result, SyncError};

pub use filter::IgnoreFilter;
pub use store::{CacheSnapshot, SnapshotStore};

/// Portion of the library a refresh re-lists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum RefreshScope {
    All,
    Library(LibraryId),
    Show(ShowId),
}

impl fmt::Display for RefreshScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshScope::All => f.write_str("all"),
            RefreshScope::Library(id) => write!(f, "library {id}"),
            RefreshScope::Show(id) => write!(f, "show {id}"),
        }
    }
}

/// Episode reference carried in a [`RefreshReport`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpisodeRef {
    pub show_id: ShowId,
    pub episode_id: EpisodeId,
}

/// Sub-scope that could not be listed during a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshFailure {
    pub scope: RefreshScope,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Episodes not previously cached, in listing order.
    pub added: Vec<EpisodeRef>,
    /// Episodes whose media files were replaced. Their cached selections
    /// have been dropped.
    pub updated: Vec<EpisodeRef>,
    pub removed: Vec<EpisodeRef>,
    pub failed: Vec<RefreshFailure>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }

    fn fail(&mut self, scope: RefreshScope, err: &SyncError) {
        self.failed.push(RefreshFailure {
            scope,
            reason: err.to_string(),
        });
    }
}

/// Counts exposed on the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub libraries: usize,
    pub ignored_libraries: usize,
    pub shows: usize,
    pub ignored_shows: usize,
    pub episodes: usize,
    pub selections: usize,
    pub pending_refreshes: usize,
    pub pending_propagations: usize,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Result of [`LibraryCache::upsert_episode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Media parts changed; cached selections were dropped.
    Replaced,
}

type ShowNode = Arc<Mutex<Show>>;

pub struct LibraryCache {
    filter: IgnoreFilter,
    libraries: DashMap<LibraryId, Library>,
    library_shows: DashMap<LibraryId, BTreeSet<ShowId>>,
    shows: DashMap<ShowId, ShowNode>,
    episode_index: DashMap<EpisodeId, ShowId>,
    refresh_retries: DashSet<RefreshScope>,
    propagation_retries: DashSet<(ShowId, UserId)>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    refresh_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl fmt::Debug for LibraryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryCache")
            .field("filter", &self.filter)
            .field("libraries", &self.libraries.len())
            .field("shows", &self.shows.len())
            .field("episodes", &self.episode_index.len())
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish()
    }
}

impl LibraryCache {
    pub fn new(filter: IgnoreFilter) -> Self {
        Self {
            filter,
            libraries: DashMap::new(),
            library_shows: DashMap::new(),
            shows: DashMap::new(),
            episode_index: DashMap::new(),
            refresh_retries: DashSet::new(),
            propagation_retries: DashSet::new(),
            last_refresh: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Rebuilds a cache from a stored snapshot. Ignore flags are recomputed
    /// against `filter`, which may differ from the one in effect when the
    /// snapshot was written.
    pub fn from_snapshot(snapshot: CacheSnapshot, filter: IgnoreFilter) -> Self {
        let mut cache = Self::new(filter);

        for mut library in snapshot.libraries {
            library.ignored = cache.filter.library_ignored(&library.name);
            cache.library_shows.entry(library.id.clone()).or_default();
            cache.libraries.insert(library.id.clone(), library);
        }

        for mut show in snapshot.shows {
            let library_ignored = cache
                .libraries
                .get(&show.library_id)
                .map(|library| library.ignored)
                .unwrap_or(false);
            show.ignored = library_ignored || cache.filter.show_ignored(&show.labels);
            cache
                .library_shows
                .entry(show.library_id.clone())
                .or_default()
                .insert(show.id.clone());
            for episode in show.episodes() {
                cache.episode_index.insert(episode.id.clone(), show.id.clone());
            }
            cache.shows.insert(show.id.clone(), Arc::new(Mutex::new(show)));
        }

        for scope in snapshot.refresh_retries {
            cache.refresh_retries.insert(scope);
        }
        for pair in snapshot.propagation_retries {
            cache.propagation_retries.insert(pair);
        }
        cache.last_refresh = RwLock::new(snapshot.last_refresh);
        cache
    }

    pub fn filter(&self) -> &IgnoreFilter {
        &self.filter
    }

    pub fn library(&self, id: &LibraryId) -> Option<Library> {
        self.libraries.get(id).map(|entry| entry.value().clone())
    }

    pub fn libraries(&self) -> Vec<Library> {
        let mut libraries: Vec<Library> =
            self.libraries.iter().map(|entry| entry.value().clone()).collect();
        libraries.sort_by(|a, b| a.id.cmp(&b.id));
        libraries
    }

    /// Owned copy of the show as currently cached.
    pub async fn show(&self, id: &ShowId) -> Option<Show> {
        let node = self.node(id)?;
        let show = node.lock().await;
        Some(show.clone())
    }

    pub fn contains_show(&self, id: &ShowId) -> bool {
        self.shows.contains_key(id)
    }

    pub fn show_ids(&self) -> Vec<ShowId> {
        let mut ids: Vec<ShowId> = self.shows.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn shows_in_library(&self, library: &LibraryId) -> Vec<ShowId> {
        self.library_shows
            .get(library)
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn show_of(&self, episode: &EpisodeId) -> Option<ShowId> {
        self.episode_index.get(episode).map(|entry| entry.value().clone())
    }

    pub fn contains_episode(&self, episode: &EpisodeId) -> bool {
        self.episode_index.contains_key(episode)
    }

    pub async fn episode(&self, id: &EpisodeId) -> Option<Episode> {
        let show_id = self.show_of(id)?;
        let node = self.node(&show_id)?;
        let show = node.lock().await;
        show.episode(id).cloned()
    }

    /// Unknown shows count as not ignored; callers check existence first.
    pub async fn is_ignored_show(&self, id: &ShowId) -> bool {
        match self.node(id) {
            Some(node) => node.lock().await.ignored,
            None => false,
        }
    }

    pub fn is_ignored_library(&self, id: &LibraryId) -> bool {
        self.libraries
            .get(id)
            .map(|entry| entry.value().ignored)
            .unwrap_or(false)
    }

    /// Attaches `selection` to (episode, user) and returns what it replaced.
    pub async fn record_selection(
        &self,
        episode: &EpisodeId,
        user: &UserId,
        selection: TrackSelection,
    ) -> Result<Option<TrackSelection>> {
        let show_id = self
            .show_of(episode)
            .ok_or_else(|| SyncError::NotFound(format!("episode {episode} is not cached")))?;
        let node = self
            .node(&show_id)
            .ok_or_else(|| SyncError::NotFound(format!("show {show_id} is not cached")))?;
        let mut show = node.lock().await;
        let entry = show
            .episode_mut(episode)
            .ok_or_else(|| SyncError::NotFound(format!("episode {episode} is not cached")))?;
        let previous = entry.selections.insert(user.clone(), selection);
        self.mark_dirty();
        Ok(previous)
    }

    /// Inserts or updates a single episode below an already cached show.
    pub async fn upsert_episode(
        &self,
        show_id: &ShowId,
        season: &SeasonListing,
        listing: EpisodeListing,
    ) -> Result<UpsertOutcome> {
        let node = self
            .node(show_id)
            .ok_or_else(|| SyncError::NotFound(format!("show {show_id} is not cached")))?;
        let mut show = node.lock().await;

        if let Some(owner) = self.show_of(&listing.id)
            && &owner != show_id
        {
            return Err(SyncError::Configuration(format!(
                "episode {} already belongs to show {owner}",
                listing.id
            )));
        }

        let previous = detach_episode(&mut show, &listing.id);
        let (episode, outcome) = merge_listing(listing, season.id.clone(), previous);
        let season_node = season_entry(&mut show, season);
        insert_ordered(&mut season_node.episodes, episode.clone());
        self.episode_index.insert(episode.id.clone(), show_id.clone());
        self.mark_dirty();

        debug!(show = %show_id, episode = %episode.id, position = %episode.position, ?outcome, "upserted episode");
        Ok(outcome)
    }

    /// Drops an episode that no longer exists upstream.
    pub async fn prune_episode(&self, episode: &EpisodeId) -> bool {
        let Some((_, show_id)) = self.episode_index.remove(episode) else {
            return false;
        };
        if let Some(node) = self.node(&show_id) {
            let mut show = node.lock().await;
            detach_episode(&mut show, episode);
            show.seasons.retain(|season| !season.episodes.is_empty());
        }
        self.mark_dirty();
        true
    }

    pub fn mark_propagation_retry(&self, show: &ShowId, user: &UserId) {
        if self.propagation_retries.insert((show.clone(), user.clone())) {
            self.mark_dirty();
        }
    }

    pub fn clear_propagation_retry(&self, show: &ShowId, user: &UserId) {
        if self
            .propagation_retries
            .remove(&(show.clone(), user.clone()))
            .is_some()
        {
            self.mark_dirty();
        }
    }

    pub fn propagation_retries(&self) -> Vec<(ShowId, UserId)> {
        let mut pairs: Vec<_> = self
            .propagation_retries
            .iter()
            .map(|pair| pair.key().clone())
            .collect();
        pairs.sort();
        pairs
    }

    pub fn pending_refreshes(&self) -> Vec<RefreshScope> {
        let mut scopes: Vec<_> = self
            .refresh_retries
            .iter()
            .map(|scope| scope.key().clone())
            .collect();
        scopes.sort();
        scopes
    }

    pub async fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.read().await
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub async fn summary(&self) -> CacheSummary {
        let mut summary = CacheSummary {
            libraries: self.libraries.len(),
            ignored_libraries: self
                .libraries
                .iter()
                .filter(|entry| entry.value().ignored)
                .count(),
            pending_refreshes: self.refresh_retries.len(),
            pending_propagations: self.propagation_retries.len(),
            last_refresh: self.last_refresh().await,
            ..CacheSummary::default()
        };

        for node in self.nodes() {
            let show = node.lock().await;
            summary.shows += 1;
            if show.ignored {
                summary.ignored_shows += 1;
            }
            summary.episodes += show.episode_count();
            summary.selections += show
                .episodes()
                .map(|episode| episode.selections.len())
                .sum::<usize>();
        }
        summary
    }

    /// Captures the whole cache and clears the dirty flag. The flag is
    /// cleared before reading so that concurrent writes set it again.
    pub async fn snapshot(&self) -> CacheSnapshot {
        self.dirty.store(false, Ordering::Release);

        let mut shows = Vec::with_capacity(self.shows.len());
        for node in self.nodes() {
            shows.push(node.lock().await.clone());
        }
        shows.sort_by(|a, b| a.id.cmp(&b.id));

        CacheSnapshot::new(
            self.last_refresh().await,
            self.libraries(),
            shows,
            self.pending_refreshes(),
            self.propagation_retries(),
        )
    }

    /// Saves the snapshot if anything changed since the last save.
    pub async fn persist_if_dirty(&self, store: &SnapshotStore) -> Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let snapshot = self.snapshot().await;
        match store.save(&snapshot).await {
            Ok(bytes) => {
                debug!(bytes, shows = snapshot.shows.len(), "saved cache snapshot");
                Ok(true)
            }
            Err(err) => {
                self.mark_dirty();
                Err(err)
            }
        }
    }

    fn node(&self, id: &ShowId) -> Option<ShowNode> {
        self.shows.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Show nodes copied out of the map, so no shard guard is held while
    /// the caller awaits a show lock.
    fn nodes(&self) -> Vec<ShowNode> {
        self.shows
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

/// Removes an episode from whichever season holds it.
fn detach_episode(show: &mut Show, id: &EpisodeId) -> Option<Episode> {
    for season in &mut show.seasons {
        if let Some(index) = season.episodes.iter().position(|e| &e.id == id) {
            return Some(season.episodes.remove(index));
        }
    }
    None
}

/// Builds the cached episode for `listing`, carrying selections over from
/// `previous` unless the media parts changed.
fn merge_listing(
    listing: EpisodeListing,
    season_id: SeasonId,
    previous: Option<Episode>,
) -> (Episode, UpsertOutcome) {
    let (selections, outcome) = match previous {
        None => (Default::default(), UpsertOutcome::Inserted),
        Some(previous) if parts_replaced(&previous.parts, &listing.parts) => {
            (Default::default(), UpsertOutcome::Replaced)
        }
        Some(previous) => (previous.selections, UpsertOutcome::Updated),
    };

    let episode = Episode {
        id: listing.id,
        season_id,
        title: listing.title,
        position: listing.position,
        parts: listing.parts,
        selections,
    };
    (episode, outcome)
}

/// A file counts as replaced only when both sides know their parts and the
/// sets differ.
fn parts_replaced(before: &[tracksync_model::PartId], after: &[tracksync_model::PartId]) -> bool {
    if before.is_empty() || after.is_empty() {
        return false;
    }
    let before: BTreeSet<_> = before.iter().collect();
    let after: BTreeSet<_> = after.iter().collect();
    before != after
}

fn season_entry<'a>(show: &'a mut Show, listing: &SeasonListing) -> &'a mut Season {
    let index = match show.seasons.iter().position(|s| s.id == listing.id) {
        Some(index) => {
            show.seasons[index].index = listing.index;
            index
        }
        None => {
            let at = show
                .seasons
                .iter()
                .position(|s| s.index > listing.index)
                .unwrap_or(show.seasons.len());
            show.seasons.insert(
                at,
                Season {
                    id: listing.id.clone(),
                    show_id: show.id.clone(),
                    index: listing.index,
                    episodes: Vec::new(),
                },
            );
            at
        }
    };
    &mut show.seasons[index]
}

fn insert_ordered(episodes: &mut Vec<Episode>, episode: Episode) {
    let at = episodes
        .iter()
        .position(|e| e.position > episode.position)
        .unwrap_or(episodes.len());
    episodes.insert(at, episode);
}
