//! Turns inbound media server signals into cache updates and propagations.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tracksync_model::{EpisodeId, LibraryId, ShowId, TrackSelection, TriggerKind, UserId};

use crate::cache::{LibraryCache, RefreshScope};
use crate::client::SelectedTracks;
use crate::engine::{Execution, PropagationEngine, PropagationRequest, PropagationSource};

/// Which inbound signals are acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerPolicy {
    pub trigger_on_play: bool,
    pub trigger_on_scan: bool,
    pub trigger_on_activity: bool,
    /// Without it a scan event never re-lists the library, so new episodes
    /// only show up at the next scheduled refresh.
    pub refresh_library_on_scan: bool,
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self {
            trigger_on_play: true,
            trigger_on_scan: true,
            trigger_on_activity: false,
            refresh_library_on_scan: true,
        }
    }
}

/// A user played (or changed tracks on) an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub user_id: UserId,
    pub episode_id: EpisodeId,
    /// Show the episode belongs to, used to load an uncached episode.
    #[serde(default)]
    pub show_id: Option<ShowId>,
    #[serde(default)]
    pub library_id: Option<LibraryId>,
    /// Tracks reported with the event. When absent they are read from the
    /// media server.
    #[serde(default)]
    pub tracks: Option<SelectedTracks>,
}

/// The media server scanned a library or a single show.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEvent {
    #[serde(default)]
    pub library_id: Option<LibraryId>,
    #[serde(default)]
    pub show_id: Option<ShowId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Played(PlaybackEvent),
    #[serde(alias = "activity")]
    ActivityChanged(PlaybackEvent),
    Scanned(ScanEvent),
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Played(_) => "played",
            InboundEvent::ActivityChanged(_) => "activity",
            InboundEvent::Scanned(_) => "scanned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The trigger for this kind of event is turned off.
    Disabled,
    /// The owning show or library is ignored.
    Ignored,
    Dropped { reason: String },
    NoSource,
    Propagated { changes: usize },
    Refreshed {
        added: usize,
        updated: usize,
        changes: usize,
    },
    Failed { reason: String },
}

impl RouteOutcome {
    fn dropped(reason: impl Into<String>) -> Self {
        RouteOutcome::Dropped {
            reason: reason.into(),
        }
    }
}

pub struct EventRouter {
    engine: Arc<PropagationEngine>,
    policy: TriggerPolicy,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("policy", &self.policy)
            .finish()
    }
}

impl EventRouter {
    pub fn new(engine: Arc<PropagationEngine>, policy: TriggerPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    /// Whether an event of this kind would be acted upon at all.
    pub fn accepts(&self, event: &InboundEvent) -> bool {
        match event {
            InboundEvent::Played(_) => self.policy.trigger_on_play,
            InboundEvent::ActivityChanged(_) => self.policy.trigger_on_activity,
            InboundEvent::Scanned(_) => self.policy.trigger_on_scan,
        }
    }

    fn cache(&self) -> &LibraryCache {
        self.engine.cache()
    }

    /// Handles one event. Failures are folded into the outcome.
    pub async fn handle(&self, event: InboundEvent) -> RouteOutcome {
        let kind = event.kind();
        if !self.accepts(&event) {
            return RouteOutcome::Disabled;
        }
        let outcome = match event {
            InboundEvent::Played(playback) | InboundEvent::ActivityChanged(playback) => {
                self.handle_playback(playback).await
            }
            InboundEvent::Scanned(scan) => self.handle_scan(scan).await,
        };

        match &outcome {
            RouteOutcome::Failed { reason } => {
                warn!(target: "tracksync::router", event = kind, %reason, "event failed")
            }
            other => debug!(target: "tracksync::router", event = kind, outcome = ?other, "event handled"),
        }
        outcome
    }

    async fn handle_playback(&self, event: PlaybackEvent) -> RouteOutcome {
        if let Some(library) = &event.library_id
            && self.cache().is_ignored_library(library)
        {
            return RouteOutcome::Ignored;
        }
        if let Some(show) = &event.show_id
            && self.cache().is_ignored_show(show).await
        {
            return RouteOutcome::Ignored;
        }

        let show_id = match self.cache().show_of(&event.episode_id) {
            Some(show_id) => show_id,
            None => match self.load_uncached(&event).await {
                Some(show_id) => show_id,
                None => return RouteOutcome::dropped("episode is not in the library cache"),
            },
        };
        if self.cache().is_ignored_show(&show_id).await {
            return RouteOutcome::Ignored;
        }

        let tracks = match event.tracks {
            Some(tracks) => tracks,
            None => match self
                .engine
                .client()
                .get_track_selection(&event.episode_id, &event.user_id)
                .await
            {
                Ok(tracks) => tracks,
                Err(err) => {
                    return RouteOutcome::Failed {
                        reason: format!("reading selected tracks: {err}"),
                    };
                }
            },
        };
        let Some(audio) = tracks.audio else {
            return RouteOutcome::dropped("no audio track selected");
        };
        let selection = TrackSelection::observed(audio, tracks.subtitle, Utc::now());

        let request = PropagationRequest {
            show_id,
            user_id: event.user_id,
            source: PropagationSource::Observed {
                episode_id: event.episode_id,
                selection,
            },
            trigger: TriggerKind::PlayOrActivity,
        };
        match self.engine.execute(request).await {
            Ok(Execution::Ignored) => RouteOutcome::Ignored,
            Ok(Execution::NoSource) => RouteOutcome::NoSource,
            Ok(execution) => RouteOutcome::Propagated {
                changes: execution.changes(),
            },
            Err(err) => RouteOutcome::Failed {
                reason: err.to_string(),
            },
        }
    }

    /// Refreshes whatever the event hints at and looks the episode up again.
    async fn load_uncached(&self, event: &PlaybackEvent) -> Option<ShowId> {
        let cache = self.cache();
        let Some(scope) = hinted_scope(cache, event.show_id.as_ref(), event.library_id.as_ref())
        else {
            debug!(target: "tracksync::router", episode = %event.episode_id, "uncached episode without a usable hint");
            return None;
        };
        let report = cache.refresh(&scope, self.engine.client().as_ref()).await;
        debug!(target: "tracksync::router", %scope, added = report.added.len(), "refreshed for uncached episode");
        cache.show_of(&event.episode_id)
    }

    async fn handle_scan(&self, event: ScanEvent) -> RouteOutcome {
        let cache = self.cache();
        if let Some(library) = &event.library_id
            && cache.is_ignored_library(library)
        {
            return RouteOutcome::Ignored;
        }
        if let Some(show) = &event.show_id
            && cache.is_ignored_show(show).await
        {
            return RouteOutcome::Ignored;
        }

        if !self.policy.refresh_library_on_scan {
            debug!(target: "tracksync::router", "refresh_library_on_scan is off, scan not inspected");
            return RouteOutcome::dropped("library refresh on scan is disabled");
        }

        let scope = hinted_scope(cache, event.show_id.as_ref(), event.library_id.as_ref())
            .unwrap_or(RefreshScope::All);
        let report = cache.refresh(&scope, self.engine.client().as_ref()).await;
        let propagation = self
            .engine
            .propagate_refresh(&report, TriggerKind::NewEpisode, TriggerKind::UpdatedEpisode)
            .await;

        if report.has_changes() {
            info!(
                target: "tracksync::router",
                %scope,
                added = report.added.len(),
                updated = report.updated.len(),
                changes = propagation.changes,
                "scan processed"
            );
        }
        RouteOutcome::Refreshed {
            added: report.added.len(),
            updated: report.updated.len(),
            changes: propagation.changes,
        }
    }

    /// Dispatches events from `events`, one task per event, until the
    /// channel closes or `shutdown` fires. In-flight events are drained
    /// before returning.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<InboundEvent>, shutdown: CancellationToken) {
        info!(target: "tracksync::router", policy = ?self.policy, "event router started");
        let mut tasks: JoinSet<RouteOutcome> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        warn!(target: "tracksync::router", error = %err, "event task aborted");
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        let router = Arc::clone(&self);
                        tasks.spawn(async move { router.handle(event).await });
                    }
                    None => break,
                },
            }
        }

        events.close();
        let pending = tasks.len();
        if pending > 0 {
            info!(target: "tracksync::router", pending, "draining in-flight events");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(target: "tracksync::router", error = %err, "event task aborted");
            }
        }
        info!(target: "tracksync::router", "event router stopped");
    }
}

/// Narrowest refresh scope covering the hint. A show hint only counts once
/// the show is cached, since listing a show needs its library.
fn hinted_scope(
    cache: &LibraryCache,
    show: Option<&ShowId>,
    library: Option<&LibraryId>,
) -> Option<RefreshScope> {
    match (show, library) {
        (Some(show), _) if cache.contains_show(show) => Some(RefreshScope::Show(show.clone())),
        (_, Some(library)) => Some(RefreshScope::Library(library.clone())),
        _ => None,
    }
}
