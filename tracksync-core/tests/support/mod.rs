#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use tracksync_core::model::{
    EpisodeId, LibraryId, PartId, SeasonId, SequencePosition, ShowId, TrackId, UserId,
};
use tracksync_core::{
    ChangeBus, EpisodeListing, EventRouter, HistoryEntry, IgnoreFilter, LibraryCache,
    LibraryListing, MediaServerClient, PropagationConfig, PropagationEngine, RefreshScope,
    Result, SeasonListing, SelectedTracks, ShowListing, SyncError, TriggerPolicy,
};

pub const LIBRARY: &str = "lib-tv";

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

pub fn tracks(audio: &str, subtitle: Option<&str>) -> SelectedTracks {
    SelectedTracks {
        audio: Some(TrackId::new(audio)),
        subtitle: subtitle.map(TrackId::new),
    }
}

/// Recorded `set_track_selection` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCall {
    pub episode: EpisodeId,
    pub user: UserId,
    pub audio: TrackId,
    pub subtitle: Option<TrackId>,
}

#[derive(Default)]
struct State {
    libraries: Vec<LibraryListing>,
    shows: BTreeMap<LibraryId, Vec<ShowListing>>,
    seasons: BTreeMap<ShowId, Vec<SeasonListing>>,
    episodes: BTreeMap<SeasonId, Vec<EpisodeListing>>,
    selections: HashMap<(EpisodeId, UserId), SelectedTracks>,
    /// Audio languages present on an episode. Episodes without an entry
    /// accept any language.
    languages: HashMap<EpisodeId, BTreeSet<TrackId>>,
    set_calls: Vec<SetCall>,
    call_times: Vec<Instant>,
    failing_seasons: HashSet<SeasonId>,
    failing_updates: HashSet<EpisodeId>,
    deleted_upstream: HashSet<EpisodeId>,
    history: Vec<HistoryEntry>,
    failing_libraries: bool,
}

/// In-memory media server.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<State>,
    update_delay: Mutex<Option<Duration>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let server = Arc::new(Self::default());
        server.add_library(LIBRARY, "TV Shows");
        server
    }

    pub fn add_library(&self, id: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.libraries.push(LibraryListing {
            id: LibraryId::new(id),
            name: name.to_string(),
        });
        state.shows.entry(LibraryId::new(id)).or_default();
    }

    /// Adds a show to `library` with `layout[i]` episodes in season `i + 1`.
    /// Episodes are named `{show}-s{season}e{episode}`.
    pub fn add_show(&self, library: &str, show: &str, title: &str, labels: &[&str], layout: &[u32]) {
        let mut state = self.state.lock().unwrap();
        state
            .shows
            .entry(LibraryId::new(library))
            .or_default()
            .push(ShowListing {
                id: ShowId::new(show),
                title: title.to_string(),
                labels: labels.iter().map(|l| l.to_string()).collect(),
            });
        let seasons = state.seasons.entry(ShowId::new(show)).or_default();
        let mut created = Vec::new();
        for (i, count) in layout.iter().enumerate() {
            let index = i as u32 + 1;
            let season_id = SeasonId::new(format!("{show}-s{index}"));
            seasons.push(SeasonListing {
                id: season_id.clone(),
                index,
            });
            created.push((season_id, index, *count));
        }
        for (season_id, index, count) in created {
            let episodes = state.episodes.entry(season_id).or_default();
            for e in 1..=count {
                episodes.push(listing(show, index, e));
            }
        }
    }

    /// Adds one episode to an existing season, creating the season if needed.
    pub fn add_episode(&self, show: &str, season: u32, episode: u32) -> EpisodeId {
        let mut state = self.state.lock().unwrap();
        let season_id = SeasonId::new(format!("{show}-s{season}"));
        let seasons = state.seasons.entry(ShowId::new(show)).or_default();
        if !seasons.iter().any(|s| s.id == season_id) {
            seasons.push(SeasonListing {
                id: season_id.clone(),
                index: season,
            });
        }
        let entry = listing(show, season, episode);
        let id = entry.id.clone();
        state.episodes.entry(season_id).or_default().push(entry);
        id
    }

    pub fn remove_episode(&self, id: &EpisodeId) {
        let mut state = self.state.lock().unwrap();
        for episodes in state.episodes.values_mut() {
            episodes.retain(|e| &e.id != id);
        }
    }

    pub fn remove_show(&self, library: &str, show: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(shows) = state.shows.get_mut(&LibraryId::new(library)) {
            shows.retain(|s| s.id.as_str() != show);
        }
    }

    /// Swaps the media part of an episode, as when a file is replaced.
    pub fn replace_file(&self, id: &EpisodeId) {
        let mut state = self.state.lock().unwrap();
        for episodes in state.episodes.values_mut() {
            for episode in episodes.iter_mut().filter(|e| &e.id == id) {
                episode.parts = vec![PartId::new(format!("{id}-replaced"))];
            }
        }
        state.selections.retain(|(episode, _), _| episode != id);
    }

    pub fn set_languages(&self, episode: &EpisodeId, languages: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .languages
            .insert(episode.clone(), languages.iter().map(|l| TrackId::new(*l)).collect());
    }

    /// The user picks tracks in their player.
    pub fn select(&self, episode: &EpisodeId, user: &UserId, selected: SelectedTracks) {
        self.state
            .lock()
            .unwrap()
            .selections
            .insert((episode.clone(), user.clone()), selected);
    }

    pub fn selection(&self, episode: &EpisodeId, user: &UserId) -> Option<SelectedTracks> {
        self.state
            .lock()
            .unwrap()
            .selections
            .get(&(episode.clone(), user.clone()))
            .cloned()
    }

    pub fn fail_season(&self, show: &str, season: u32, failing: bool) {
        let id = SeasonId::new(format!("{show}-s{season}"));
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing_seasons.insert(id);
        } else {
            state.failing_seasons.remove(&id);
        }
    }

    pub fn fail_libraries(&self, failing: bool) {
        self.state.lock().unwrap().failing_libraries = failing;
    }

    pub fn fail_updates(&self, episode: &EpisodeId, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing_updates.insert(episode.clone());
        } else {
            state.failing_updates.remove(episode);
        }
    }

    /// Removes the episode upstream without the cache noticing.
    pub fn delete_silently(&self, episode: &EpisodeId) {
        self.state
            .lock()
            .unwrap()
            .deleted_upstream
            .insert(episode.clone());
    }

    pub fn add_history(&self, user: &UserId, episode: &EpisodeId, viewed_at: DateTime<Utc>) {
        self.state.lock().unwrap().history.push(HistoryEntry {
            user_id: user.clone(),
            episode_id: episode.clone(),
            show_id: None,
            viewed_at,
        });
    }

    pub fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_calls(&self) -> Vec<SetCall> {
        self.state.lock().unwrap().set_calls.clone()
    }

    /// When each recorded `set_track_selection` call landed.
    pub fn call_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().call_times.clone()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state.lock().unwrap();
        state.set_calls.clear();
        state.call_times.clear();
    }
}

pub fn episode_id(show: &str, season: u32, episode: u32) -> EpisodeId {
    EpisodeId::new(format!("{show}-s{season}e{episode}"))
}

fn listing(show: &str, season: u32, episode: u32) -> EpisodeListing {
    let id = episode_id(show, season, episode);
    EpisodeListing {
        parts: vec![PartId::new(format!("{id}-part"))],
        id,
        title: format!("Episode {episode}"),
        position: SequencePosition::new(season, episode),
    }
}

#[async_trait]
impl MediaServerClient for FakeServer {
    async fn list_libraries(&self) -> Result<Vec<LibraryListing>> {
        let state = self.state.lock().unwrap();
        if state.failing_libraries {
            return Err(SyncError::Transient("sections unavailable".into()));
        }
        Ok(state.libraries.clone())
    }

    async fn list_shows(&self, library: &LibraryId) -> Result<Vec<ShowListing>> {
        let state = self.state.lock().unwrap();
        state
            .shows
            .get(library)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("library {library}")))
    }

    async fn list_seasons(&self, show: &ShowId) -> Result<Vec<SeasonListing>> {
        let state = self.state.lock().unwrap();
        let listed = state.shows.values().flatten().any(|s| &s.id == show);
        if !listed {
            return Err(SyncError::NotFound(format!("show {show}")));
        }
        Ok(state.seasons.get(show).cloned().unwrap_or_default())
    }

    async fn list_episodes(&self, season: &SeasonId) -> Result<Vec<EpisodeListing>> {
        let state = self.state.lock().unwrap();
        if state.failing_seasons.contains(season) {
            return Err(SyncError::Transient(format!("season {season} timed out")));
        }
        Ok(state.episodes.get(season).cloned().unwrap_or_default())
    }

    async fn get_track_selection(&self, episode: &EpisodeId, user: &UserId) -> Result<SelectedTracks> {
        Ok(self.selection(episode, user).unwrap_or(SelectedTracks {
            audio: None,
            subtitle: None,
        }))
    }

    async fn set_track_selection(
        &self,
        episode: &EpisodeId,
        user: &UserId,
        audio: &TrackId,
        subtitle: Option<&TrackId>,
    ) -> Result<()> {
        let delay = *self.update_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.deleted_upstream.contains(episode) {
            return Err(SyncError::NotFound(format!("episode {episode}")));
        }
        if state.failing_updates.contains(episode) {
            return Err(SyncError::Transient(format!("update of {episode} timed out")));
        }
        if let Some(languages) = state.languages.get(episode)
            && !languages.contains(audio)
        {
            return Err(SyncError::TrackUnavailable(format!("{episode} has no {audio} audio")));
        }
        state.call_times.push(Instant::now());
        state.set_calls.push(SetCall {
            episode: episode.clone(),
            user: user.clone(),
            audio: audio.clone(),
            subtitle: subtitle.cloned(),
        });
        state.selections.insert(
            (episode.clone(), user.clone()),
            SelectedTracks {
                audio: Some(audio.clone()),
                subtitle: subtitle.cloned(),
            },
        );
        Ok(())
    }

    async fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<HistoryEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .history
            .iter()
            .filter(|entry| entry.viewed_at >= since)
            .cloned()
            .collect())
    }
}

/// Cache, engine and router wired to one fake server.
pub struct Harness {
    pub server: Arc<FakeServer>,
    pub cache: Arc<LibraryCache>,
    pub engine: Arc<PropagationEngine>,
    pub router: Arc<EventRouter>,
    pub bus: ChangeBus,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub async fn new(server: Arc<FakeServer>, config: PropagationConfig) -> Self {
        Self::with(server, config, TriggerPolicy::default(), IgnoreFilter::default()).await
    }

    pub async fn with(
        server: Arc<FakeServer>,
        config: PropagationConfig,
        policy: TriggerPolicy,
        filter: IgnoreFilter,
    ) -> Self {
        let cache = Arc::new(LibraryCache::new(filter));
        let report = cache.refresh(&RefreshScope::All, server.as_ref()).await;
        assert!(report.is_clean(), "initial refresh failed: {:?}", report.failed);

        let bus = ChangeBus::new(64);
        let shutdown = CancellationToken::new();
        let client: Arc<dyn MediaServerClient> = server.clone();
        let engine = Arc::new(PropagationEngine::new(
            cache.clone(),
            client,
            bus.clone(),
            config,
            shutdown.clone(),
        ));
        let router = Arc::new(EventRouter::new(engine.clone(), policy));
        Self {
            server,
            cache,
            engine,
            router,
            bus,
            shutdown,
        }
    }
}

pub fn config(level: &str, strategy: &str) -> PropagationConfig {
    PropagationConfig {
        update_level: level.parse().unwrap(),
        update_strategy: strategy.parse().unwrap(),
        batch_pause_ms: 0,
        ..PropagationConfig::default()
    }
}
