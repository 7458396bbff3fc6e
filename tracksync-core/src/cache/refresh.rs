use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tracksync_model::{Episode, EpisodeId, Library, LibraryId, Season, SeasonId, Show, ShowId};

use super::{
    EpisodeRef, LibraryCache, RefreshReport, RefreshScope, UpsertOutcome, merge_listing,
};
use crate::client::{EpisodeListing, LibraryListing, MediaServerClient, SeasonListing, ShowListing};
use crate::error::SyncError;

/// Bookkeeping for one refresh call.
#[derive(Default)]
struct Pass {
    report: RefreshReport,
    /// Scopes fully re-listed, whose pending retries can be dropped.
    covered: BTreeSet<RefreshScope>,
}

impl Pass {
    fn fail(&mut self, scope: RefreshScope, err: &SyncError) {
        warn!(target: "tracksync::cache", %scope, error = %err, "refresh failed, keeping previous state");
        self.report.fail(scope, err);
    }
}

/// Changes applied to one show by a merge.
#[derive(Default)]
struct ShowDelta {
    added: Vec<EpisodeId>,
    updated: Vec<EpisodeId>,
    removed: Vec<EpisodeId>,
}

impl ShowDelta {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

type SeasonFetch = (SeasonListing, Option<Vec<EpisodeListing>>);

impl LibraryCache {
    /// Re-lists `scope` from the media server and merges the result.
    ///
    /// Refreshes are serialized against each other. Listing calls run
    /// without holding any show lock; each show is locked only while its
    /// listing is merged, so cached selections written meanwhile survive.
    pub async fn refresh(
        &self,
        scope: &RefreshScope,
        client: &dyn MediaServerClient,
    ) -> RefreshReport {
        let _serial = self.refresh_lock.lock().await;
        let started = Utc::now();
        let mut pass = Pass::default();

        match scope {
            RefreshScope::All => self.refresh_all(client, &mut pass).await,
            RefreshScope::Library(id) => self.refresh_library_scope(id, client, &mut pass).await,
            RefreshScope::Show(id) => self.refresh_show_scope(id, client, &mut pass).await,
        }

        self.settle_retries(scope, &pass);
        if *scope == RefreshScope::All && pass.report.is_clean() {
            *self.last_refresh.write().await = Some(started);
            self.mark_dirty();
        }

        let report = pass.report;
        info!(
            target: "tracksync::cache",
            %scope,
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "refresh finished"
        );
        report
    }

    async fn refresh_all(&self, client: &dyn MediaServerClient, pass: &mut Pass) {
        let listings = match client.list_libraries().await {
            Ok(listings) => listings,
            Err(err) => {
                pass.fail(RefreshScope::All, &err);
                return;
            }
        };

        let seen: HashSet<LibraryId> = listings.iter().map(|l| l.id.clone()).collect();
        for listing in listings {
            let library = self.upsert_library(listing);
            self.refresh_library(&library, client, pass).await;
        }

        let stale: Vec<LibraryId> = self
            .libraries
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !seen.contains(id))
            .collect();
        for id in stale {
            self.prune_library(&id, pass).await;
        }
    }

    async fn refresh_library_scope(
        &self,
        id: &LibraryId,
        client: &dyn MediaServerClient,
        pass: &mut Pass,
    ) {
        if let Some(library) = self.library(id) {
            self.refresh_library(&library, client, pass).await;
            return;
        }

        // A library we have never seen: find its name first.
        match client.list_libraries().await {
            Ok(listings) => match listings.into_iter().find(|l| &l.id == id) {
                Some(listing) => {
                    let library = self.upsert_library(listing);
                    self.refresh_library(&library, client, pass).await;
                }
                None => debug!(target: "tracksync::cache", library = %id, "library not on server"),
            },
            Err(err) => pass.fail(RefreshScope::Library(id.clone()), &err),
        }
    }

    async fn refresh_show_scope(
        &self,
        id: &ShowId,
        client: &dyn MediaServerClient,
        pass: &mut Pass,
    ) {
        let Some(node) = self.node(id) else {
            debug!(target: "tracksync::cache", show = %id, "show not cached, nothing to refresh");
            return;
        };
        let (library_id, ignored) = {
            let show = node.lock().await;
            (show.library_id.clone(), show.ignored)
        };
        if ignored || self.is_ignored_library(&library_id) {
            pass.covered.insert(RefreshScope::Show(id.clone()));
            return;
        }
        self.refresh_show(id, client, pass).await;
    }

    fn upsert_library(&self, listing: LibraryListing) -> Library {
        let library = Library {
            ignored: self.filter.library_ignored(&listing.name),
            id: listing.id,
            name: listing.name,
        };
        let changed = self
            .libraries
            .get(&library.id)
            .map(|existing| *existing.value() != library)
            .unwrap_or(true);
        if changed {
            self.libraries.insert(library.id.clone(), library.clone());
            self.mark_dirty();
        }
        self.library_shows.entry(library.id.clone()).or_default();
        library
    }

    async fn refresh_library(
        &self,
        library: &Library,
        client: &dyn MediaServerClient,
        pass: &mut Pass,
    ) {
        let scope = RefreshScope::Library(library.id.clone());

        if library.ignored {
            for show_id in self.shows_in_library(&library.id) {
                if let Some(node) = self.node(&show_id) {
                    node.lock().await.ignored = true;
                }
            }
            debug!(target: "tracksync::cache", library = %library.name, "library ignored, shows not listed");
            pass.covered.insert(scope);
            return;
        }

        let listings = match client.list_shows(&library.id).await {
            Ok(listings) => listings,
            Err(err) if err.is_not_found() => {
                self.prune_library(&library.id, pass).await;
                return;
            }
            Err(err) => {
                pass.fail(scope, &err);
                return;
            }
        };

        let seen: HashSet<ShowId> = listings.iter().map(|l| l.id.clone()).collect();
        for listing in listings {
            let show_id = listing.id.clone();
            if self.upsert_show(&library.id, listing).await {
                debug!(target: "tracksync::cache", show = %show_id, "show ignored by label");
                pass.covered.insert(RefreshScope::Show(show_id));
                continue;
            }
            self.refresh_show(&show_id, client, pass).await;
        }

        for show_id in self.shows_in_library(&library.id) {
            if !seen.contains(&show_id) {
                self.prune_show(&show_id, pass).await;
            }
        }
        pass.covered.insert(scope);
    }

    /// Creates or updates the show node and returns its ignored flag.
    async fn upsert_show(&self, library_id: &LibraryId, listing: ShowListing) -> bool {
        let ignored = self.filter.show_ignored(&listing.labels);

        if let Some(node) = self.node(&listing.id) {
            let mut show = node.lock().await;
            if &show.library_id != library_id {
                if let Some(mut previous) = self.library_shows.get_mut(&show.library_id) {
                    previous.remove(&show.id);
                }
                show.library_id = library_id.clone();
            }
            let changed =
                show.title != listing.title || show.labels != listing.labels || show.ignored != ignored;
            show.title = listing.title;
            show.labels = listing.labels;
            show.ignored = ignored;
            if changed {
                self.mark_dirty();
            }
        } else {
            let show = Show {
                id: listing.id.clone(),
                library_id: library_id.clone(),
                title: listing.title,
                labels: listing.labels,
                ignored,
                seasons: Vec::new(),
            };
            self.shows.insert(listing.id.clone(), Arc::new(Mutex::new(show)));
            self.mark_dirty();
        }

        self.library_shows
            .entry(library_id.clone())
            .or_default()
            .insert(listing.id);
        ignored
    }

    async fn refresh_show(&self, id: &ShowId, client: &dyn MediaServerClient, pass: &mut Pass) {
        let scope = RefreshScope::Show(id.clone());

        let seasons = match client.list_seasons(id).await {
            Ok(seasons) => seasons,
            Err(err) if err.is_not_found() => {
                self.prune_show(id, pass).await;
                return;
            }
            Err(err) => {
                pass.fail(scope, &err);
                return;
            }
        };

        let mut fetched: Vec<SeasonFetch> = Vec::with_capacity(seasons.len());
        let mut failed = false;
        for season in seasons {
            match client.list_episodes(&season.id).await {
                Ok(episodes) => fetched.push((season, Some(episodes))),
                Err(err) if err.is_not_found() => {
                    debug!(target: "tracksync::cache", show = %id, season = %season.id, "season vanished during refresh");
                }
                Err(err) => {
                    if !failed {
                        pass.fail(scope.clone(), &err);
                        failed = true;
                    }
                    fetched.push((season, None));
                }
            }
        }

        let Some(node) = self.node(id) else {
            return;
        };
        let mut show = node.lock().await;
        let delta = merge_seasons(&mut show, fetched);

        for episode in &delta.added {
            self.episode_index.insert(episode.clone(), id.clone());
        }
        for episode in &delta.removed {
            self.episode_index.remove_if(episode, |_, owner| owner == id);
        }
        drop(show);

        if !delta.is_empty() {
            self.mark_dirty();
        }
        let to_ref = |episode_id: EpisodeId| EpisodeRef {
            show_id: id.clone(),
            episode_id,
        };
        pass.report.added.extend(delta.added.into_iter().map(to_ref));
        pass.report.updated.extend(delta.updated.into_iter().map(to_ref));
        pass.report.removed.extend(delta.removed.into_iter().map(to_ref));
        if !failed {
            pass.covered.insert(scope);
        }
    }

    async fn prune_show(&self, id: &ShowId, pass: &mut Pass) {
        let Some((_, node)) = self.shows.remove(id) else {
            return;
        };
        let show = node.lock().await;
        if let Some(mut shows) = self.library_shows.get_mut(&show.library_id) {
            shows.remove(id);
        }
        for episode in show.episodes() {
            self.episode_index.remove(&episode.id);
            pass.report.removed.push(EpisodeRef {
                show_id: id.clone(),
                episode_id: episode.id.clone(),
            });
        }
        self.propagation_retries.retain(|(show_id, _)| show_id != id);
        pass.covered.insert(RefreshScope::Show(id.clone()));
        self.mark_dirty();
        info!(target: "tracksync::cache", show = %id, title = %show.title, "pruned show");
    }

    async fn prune_library(&self, id: &LibraryId, pass: &mut Pass) {
        for show_id in self.shows_in_library(id) {
            self.prune_show(&show_id, pass).await;
        }
        self.library_shows.remove(id);
        if let Some((_, library)) = self.libraries.remove(id) {
            info!(target: "tracksync::cache", library = %library.name, "pruned library");
        }
        pass.covered.insert(RefreshScope::Library(id.clone()));
        self.mark_dirty();
    }

    fn settle_retries(&self, scope: &RefreshScope, pass: &Pass) {
        if *scope == RefreshScope::All && pass.report.is_clean() {
            self.refresh_retries.clear();
        } else {
            for covered in &pass.covered {
                self.refresh_retries.remove(covered);
            }
        }
        for failure in &pass.report.failed {
            self.refresh_retries.insert(failure.scope.clone());
        }
    }
}

/// Replaces the seasons of `show` with the fetched listing.
///
/// Seasons whose episode listing failed (`None`) keep their cached
/// episodes. Episodes carry their selections across seasons, so one moved
/// between seasons upstream is an update rather than a remove + add.
fn merge_seasons(show: &mut Show, fetched: Vec<SeasonFetch>) -> ShowDelta {
    let mut delta = ShowDelta::default();
    let mut old_seasons: HashMap<SeasonId, Season> =
        show.seasons.drain(..).map(|s| (s.id.clone(), s)).collect();

    let fresh_ids: HashSet<EpisodeId> = fetched
        .iter()
        .filter_map(|(_, episodes)| episodes.as_ref())
        .flatten()
        .map(|listing| listing.id.clone())
        .collect();

    let mut kept: Vec<Season> = Vec::new();
    let mut moved_out: Vec<Episode> = Vec::new();
    for (listing, episodes) in &fetched {
        if episodes.is_none()
            && let Some(mut season) = old_seasons.remove(&listing.id)
        {
            season.index = listing.index;
            let (moved, stayed): (Vec<Episode>, Vec<Episode>) = season
                .episodes
                .into_iter()
                .partition(|e| fresh_ids.contains(&e.id));
            season.episodes = stayed;
            moved_out.extend(moved);
            kept.push(season);
        }
    }

    let mut previous: HashMap<EpisodeId, Episode> = old_seasons
        .into_values()
        .flat_map(|season| season.episodes)
        .chain(moved_out)
        .map(|episode| (episode.id.clone(), episode))
        .collect();

    let mut seasons = kept;
    for (listing, episodes) in fetched {
        let Some(episodes) = episodes else {
            continue;
        };
        let mut season = Season {
            id: listing.id,
            show_id: show.id.clone(),
            index: listing.index,
            episodes: Vec::with_capacity(episodes.len()),
        };
        for episode_listing in episodes {
            let prior = previous.remove(&episode_listing.id);
            let (episode, outcome) = merge_listing(episode_listing, season.id.clone(), prior);
            match outcome {
                UpsertOutcome::Inserted => delta.added.push(episode.id.clone()),
                UpsertOutcome::Replaced => delta.updated.push(episode.id.clone()),
                UpsertOutcome::Updated => {}
            }
            season.episodes.push(episode);
        }
        season.episodes.sort_by_key(|episode| episode.position);
        seasons.push(season);
    }
    seasons.sort_by_key(|season| season.index);

    let mut removed: Vec<Episode> = previous.into_values().collect();
    removed.sort_by_key(|episode| episode.position);
    delta.removed = removed.into_iter().map(|episode| episode.id).collect();

    show.seasons = seasons;
    delta
}
