//! Applies a selection to its resolved target episodes.
//!
//! All work for one (show, user) pair runs under that pair's lock, and the
//! show is re-read from the cache after the lock is taken. Two events for
//! the same pair therefore apply one after the other, each against the state
//! the previous one left behind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tracksync_model::{
    ChangeRecord, EpisodeId, SequencePosition, ShowId, TrackSelection, TriggerKind, UpdateLevel,
    UpdateStrategy, UserId,
};

use crate::cache::{LibraryCache, RefreshReport};
use crate::client::MediaServerClient;
use crate::error::{Result, SyncError};
use crate::notifier::{ChangeBatch, ChangeBus};
use crate::resolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub update_level: UpdateLevel,
    pub update_strategy: UpdateStrategy,
    /// Update calls in flight across all pairs.
    pub max_concurrent_updates: usize,
    /// Targets updated back to back before pausing.
    pub batch_size: usize,
    pub batch_pause_ms: u64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            update_level: UpdateLevel::default(),
            update_strategy: UpdateStrategy::default(),
            max_concurrent_updates: 4,
            batch_size: 50,
            batch_pause_ms: 250,
        }
    }
}

impl PropagationConfig {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

/// Lazily created mutex per (show, user).
#[derive(Default)]
pub struct PairLocks {
    locks: DashMap<(ShowId, UserId), Arc<Mutex<()>>>,
}

impl fmt::Debug for PairLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairLocks")
            .field("pairs", &self.locks.len())
            .finish()
    }
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, show: &ShowId, user: &UserId) -> PairGuard {
        let mutex = self
            .locks
            .entry((show.clone(), user.clone()))
            .or_default()
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        PairGuard {
            show_id: show.clone(),
            user_id: user.clone(),
            _guard: guard,
        }
    }
}

/// Proof that the caller holds the lock of one (show, user) pair.
pub struct PairGuard {
    show_id: ShowId,
    user_id: UserId,
    _guard: OwnedMutexGuard<()>,
}

impl fmt::Debug for PairGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairGuard")
            .field("show_id", &self.show_id)
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl PairGuard {
    pub fn show_id(&self) -> &ShowId {
        &self.show_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

/// A target that could not be updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFailure {
    pub episode_id: EpisodeId,
    pub reason: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagationOutcome {
    pub changes: Vec<ChangeRecord>,
    pub failures: Vec<TargetFailure>,
    /// Targets already holding the selection.
    pub skipped: usize,
    /// Shutdown interrupted the batch.
    pub cancelled: bool,
}

impl PropagationOutcome {
    /// Whether the pair needs another attempt later.
    pub fn needs_retry(&self) -> bool {
        self.cancelled || self.failures.iter().any(|failure| failure.retryable)
    }

    pub fn error(&self, total: usize) -> Option<SyncError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(SyncError::PartialBatch {
                failed: self.failures.len(),
                total,
            })
        }
    }
}

/// Where the selection to propagate comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum PropagationSource {
    /// The user just picked `selection` on `episode_id`.
    Observed {
        episode_id: EpisodeId,
        selection: TrackSelection,
    },
    /// Fill freshly added (or replaced) episodes from the user's latest
    /// selection elsewhere in the show.
    NewEpisodes(Vec<EpisodeId>),
    /// Re-apply the user's latest selection in the show.
    ReapplyLatest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropagationRequest {
    pub show_id: ShowId,
    pub user_id: UserId,
    pub source: PropagationSource,
    pub trigger: TriggerKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The show is ignored; nothing was touched.
    Ignored,
    /// No selection to propagate from.
    NoSource,
    Completed {
        source_episode: EpisodeId,
        targets: usize,
        outcome: PropagationOutcome,
    },
}

impl Execution {
    pub fn changes(&self) -> usize {
        match self {
            Execution::Completed { outcome, .. } => outcome.changes.len(),
            _ => 0,
        }
    }
}

/// Totals of [`PropagationEngine::propagate_refresh`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshPropagation {
    pub requests: usize,
    pub changes: usize,
    pub failed: usize,
}

pub struct PropagationEngine {
    cache: Arc<LibraryCache>,
    client: Arc<dyn MediaServerClient>,
    bus: ChangeBus,
    locks: PairLocks,
    permits: Arc<Semaphore>,
    config: PropagationConfig,
    shutdown: CancellationToken,
}

impl fmt::Debug for PropagationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagationEngine")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .field("available_permits", &self.permits.available_permits())
            .field("bus", &self.bus)
            .finish()
    }
}

impl PropagationEngine {
    pub fn new(
        cache: Arc<LibraryCache>,
        client: Arc<dyn MediaServerClient>,
        bus: ChangeBus,
        config: PropagationConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_updates.max(1)));
        Self {
            cache,
            client,
            bus,
            locks: PairLocks::new(),
            permits,
            config,
            shutdown,
        }
    }

    pub fn cache(&self) -> &Arc<LibraryCache> {
        &self.cache
    }

    pub fn client(&self) -> &Arc<dyn MediaServerClient> {
        &self.client
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub async fn lock(&self, show: &ShowId, user: &UserId) -> PairGuard {
        self.locks.lock(show, user).await
    }

    /// Runs one request end to end.
    ///
    /// Fails only when the show (or the observed episode) is not cached.
    /// Per-target failures are reported in the outcome and queue the pair
    /// for the reconciler.
    #[tracing::instrument(
        target = "tracksync::engine",
        skip(self, request),
        fields(show = %request.show_id, user = %request.user_id, trigger = %request.trigger)
    )]
    pub async fn execute(&self, request: PropagationRequest) -> Result<Execution> {
        let PropagationRequest {
            show_id,
            user_id,
            source,
            trigger,
        } = request;

        let guard = self.lock(&show_id, &user_id).await;

        if self.cache.is_ignored_show(&show_id).await {
            tracing::debug!(target: "tracksync::engine", "show ignored, skipping");
            return Ok(Execution::Ignored);
        }

        if let PropagationSource::Observed {
            episode_id,
            selection,
        } = &source
        {
            self.cache
                .record_selection(episode_id, &user_id, selection.clone())
                .await?;
        }

        let show = self
            .cache
            .show(&show_id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("show {show_id} is not cached")))?;
        let level = self.config.update_level;
        let strategy = self.config.update_strategy;

        let (source_episode, selection, targets) = match source {
            PropagationSource::Observed {
                episode_id,
                selection,
            } => {
                let targets = resolver::resolve(&show, &episode_id, level, strategy);
                (episode_id, selection, targets)
            }
            PropagationSource::NewEpisodes(episodes) => {
                let Some((holder, selection)) = resolver::baseline(&show, &user_id, &episodes)
                else {
                    tracing::debug!(target: "tracksync::engine", "no baseline selection, leaving new episodes untouched");
                    return Ok(Execution::NoSource);
                };
                let mut targets: Vec<(SequencePosition, EpisodeId)> = episodes
                    .iter()
                    .filter_map(|id| show.episode(id).map(|e| (e.position, e.id.clone())))
                    .collect();
                targets.sort();
                targets.dedup();
                (
                    holder.id.clone(),
                    selection.clone(),
                    targets.into_iter().map(|(_, id)| id).collect(),
                )
            }
            PropagationSource::ReapplyLatest => {
                let Some((holder, selection)) = resolver::baseline(&show, &user_id, &[]) else {
                    self.cache.clear_propagation_retry(&show_id, &user_id);
                    return Ok(Execution::NoSource);
                };
                let targets = resolver::resolve(&show, &holder.id, level, strategy);
                (holder.id.clone(), selection.clone(), targets)
            }
        };

        let outcome = self
            .propagate(&guard, &source_episode, &selection, &targets, trigger)
            .await;

        if outcome.needs_retry() {
            self.cache.mark_propagation_retry(&show_id, &user_id);
        } else {
            self.cache.clear_propagation_retry(&show_id, &user_id);
        }
        if let Some(err) = outcome.error(targets.len()) {
            tracing::warn!(target: "tracksync::engine", error = %err, "propagation incomplete");
        }

        if !outcome.changes.is_empty() {
            let positions = targets
                .iter()
                .filter_map(|id| show.episode(id).map(|e| e.position))
                .collect();
            let batch = ChangeBatch {
                batch_id: Uuid::now_v7(),
                show_id: show_id.clone(),
                show_title: show.title.clone(),
                user_id: user_id.clone(),
                trigger,
                source_episode: source_episode.clone(),
                selection: selection.clone(),
                targets: positions,
                changes: outcome.changes.clone(),
                failed: outcome.failures.len(),
            };
            self.bus.publish(batch);
        }

        tracing::info!(
            target: "tracksync::engine",
            title = %show.title,
            source = %source_episode,
            tracks = %selection.describe(),
            targets = targets.len(),
            changed = outcome.changes.len(),
            skipped = outcome.skipped,
            failed = outcome.failures.len(),
            "propagation finished"
        );

        Ok(Execution::Completed {
            source_episode,
            targets: targets.len(),
            outcome,
        })
    }

    /// Runs new-episode propagation for the episodes a refresh added or
    /// replaced, once per show and user holding selections in that show.
    pub async fn propagate_refresh(
        &self,
        report: &RefreshReport,
        added: TriggerKind,
        updated: TriggerKind,
    ) -> RefreshPropagation {
        let mut summary = RefreshPropagation::default();
        for (episodes, trigger) in [(&report.added, added), (&report.updated, updated)] {
            let mut by_show: BTreeMap<&ShowId, Vec<EpisodeId>> = BTreeMap::new();
            for episode in episodes {
                by_show
                    .entry(&episode.show_id)
                    .or_default()
                    .push(episode.episode_id.clone());
            }

            for (show_id, episodes) in by_show {
                let Some(show) = self.cache.show(show_id).await else {
                    continue;
                };
                if show.ignored {
                    continue;
                }
                let requests = show.users().into_iter().map(|user_id| {
                    self.execute(PropagationRequest {
                        show_id: show_id.clone(),
                        user_id,
                        source: PropagationSource::NewEpisodes(episodes.clone()),
                        trigger,
                    })
                });
                for result in join_all(requests).await {
                    summary.requests += 1;
                    match result {
                        Ok(execution) => summary.changes += execution.changes(),
                        Err(err) => {
                            summary.failed += 1;
                            tracing::warn!(target: "tracksync::engine", show = %show_id, %trigger, error = %err, "new episode propagation failed");
                        }
                    }
                }
            }
        }
        summary
    }

    /// Applies `selection` to `targets` in the given order.
    ///
    /// Targets already holding the same tracks for the user are skipped
    /// without calling the server. A failing target does not stop the batch.
    pub async fn propagate(
        &self,
        guard: &PairGuard,
        source_episode: &EpisodeId,
        selection: &TrackSelection,
        targets: &[EpisodeId],
        trigger: TriggerKind,
    ) -> PropagationOutcome {
        let user = guard.user_id();
        let mut outcome = PropagationOutcome::default();
        let mut calls = 0usize;

        for target in targets {
            if self.shutdown.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let Some(episode) = self.cache.episode(target).await else {
                outcome.failures.push(TargetFailure {
                    episode_id: target.clone(),
                    reason: "episode is no longer cached".into(),
                    retryable: false,
                });
                continue;
            };
            let previous = episode.selection_for(user).cloned();
            if previous
                .as_ref()
                .is_some_and(|current| current.same_tracks(selection))
            {
                outcome.skipped += 1;
                continue;
            }

            if calls > 0 && self.config.batch_size > 0 && calls % self.config.batch_size == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        outcome.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.config.batch_pause()) => {}
                }
            }

            let Ok(permit) = self.permits.acquire().await else {
                outcome.cancelled = true;
                break;
            };
            calls += 1;
            let result = self
                .client
                .set_track_selection(target, user, &selection.audio, selection.subtitle.as_ref())
                .await;
            drop(permit);

            match result {
                Ok(()) => {
                    let applied = selection.propagated_from(source_episode);
                    if let Err(err) = self
                        .cache
                        .record_selection(target, user, applied.clone())
                        .await
                    {
                        tracing::debug!(target: "tracksync::engine", episode = %target, error = %err, "target vanished after update");
                    }
                    outcome.changes.push(ChangeRecord {
                        user_id: user.clone(),
                        show_id: guard.show_id().clone(),
                        episode_id: target.clone(),
                        position: episode.position,
                        source_episode: source_episode.clone(),
                        previous,
                        applied,
                        trigger,
                        recorded_at: Utc::now(),
                    });
                }
                Err(err) => {
                    if err.is_not_found() {
                        self.cache.prune_episode(target).await;
                    }
                    tracing::warn!(
                        target: "tracksync::engine",
                        episode = %target,
                        position = %episode.position,
                        error = %err,
                        "failed to update episode"
                    );
                    outcome.failures.push(TargetFailure {
                        episode_id: target.clone(),
                        reason: err.to_string(),
                        retryable: err.is_retryable(),
                    });
                }
            }
        }

        outcome
    }
}
