//! Periodic catch-up pass.
//!
//! Events can be missed while the service is down or the media server drops
//! a notification. The reconciler walks the same path the router uses, on a
//! daily schedule, to bring every recently active (show, user) pair back in
//! line.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tracksync_model::{EpisodeId, ShowId, TrackSelection, TriggerKind, UserId};

use crate::cache::{RefreshReport, RefreshScope};
use crate::client::HistoryEntry;
use crate::engine::{PropagationEngine, PropagationRequest, PropagationSource, RefreshPropagation};
use crate::schedule::DailySchedule;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// How far back observations and playback history are considered.
    pub lookback_hours: u32,
    /// Read playback history from the media server before reapplying.
    pub ingest_history: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            ingest_history: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub history_entries: usize,
    /// History entries that produced a newer observation.
    pub history_observed: usize,
    pub refresh: RefreshReport,
    pub new_episodes: RefreshPropagation,
    /// (show, user) pairs re-applied.
    pub pairs: usize,
    pub changes: usize,
    pub failures: usize,
    pub cancelled: bool,
}

pub struct Reconciler {
    engine: Arc<PropagationEngine>,
    config: ReconcilerConfig,
    shutdown: CancellationToken,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        engine: Arc<PropagationEngine>,
        config: ReconcilerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            config,
            shutdown,
        }
    }

    fn lookback_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::hours(i64::from(self.config.lookback_hours))
    }

    /// One full reconciliation. Never fails; problems end up in the report
    /// and the log.
    pub async fn run_pass(&self) -> ReconcileReport {
        let started_at = Utc::now();
        let since = self.lookback_start(started_at);
        let mut report = ReconcileReport {
            started_at: Some(started_at),
            ..ReconcileReport::default()
        };
        info!(target: "tracksync::reconciler", %since, "reconcile pass started");

        if self.config.ingest_history {
            self.ingest_history(since, &mut report).await;
        }

        if !self.shutdown.is_cancelled() {
            let cache = self.engine.cache();
            report.refresh = cache
                .refresh(&RefreshScope::All, self.engine.client().as_ref())
                .await;
            report.new_episodes = self
                .engine
                .propagate_refresh(&report.refresh, TriggerKind::Scheduler, TriggerKind::Scheduler)
                .await;
        }

        let pairs = self.active_pairs(since).await;
        for (show_id, user_id) in pairs {
            if self.shutdown.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.pairs += 1;
            let request = PropagationRequest {
                show_id: show_id.clone(),
                user_id: user_id.clone(),
                source: PropagationSource::ReapplyLatest,
                trigger: TriggerKind::Scheduler,
            };
            match self.engine.execute(request).await {
                Ok(execution) => report.changes += execution.changes(),
                Err(err) => {
                    report.failures += 1;
                    warn!(target: "tracksync::reconciler", show = %show_id, user = %user_id, error = %err, "reapply failed");
                }
            }
        }

        report.finished_at = Some(Utc::now());
        info!(
            target: "tracksync::reconciler",
            history = report.history_entries,
            observed = report.history_observed,
            added = report.refresh.added.len(),
            updated = report.refresh.updated.len(),
            refresh_failures = report.refresh.failed.len(),
            pairs = report.pairs,
            changes = report.changes + report.new_episodes.changes,
            failures = report.failures,
            cancelled = report.cancelled,
            "reconcile pass finished"
        );
        report
    }

    /// Records the current selection of every episode watched since `since`
    /// that the cache does not already know a newer observation for.
    async fn ingest_history(&self, since: DateTime<Utc>, report: &mut ReconcileReport) {
        let client = self.engine.client();
        let entries = match client.history_since(since).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(target: "tracksync::reconciler", error = %err, "could not read playback history");
                return;
            }
        };
        report.history_entries = entries.len();

        let cache = self.engine.cache();
        for entry in latest_views(entries) {
            if self.shutdown.is_cancelled() {
                report.cancelled = true;
                return;
            }
            let Some(show_id) = cache.show_of(&entry.episode_id) else {
                debug!(target: "tracksync::reconciler", episode = %entry.episode_id, "history entry for uncached episode");
                continue;
            };
            if cache.is_ignored_show(&show_id).await {
                continue;
            }

            let guard = self.engine.lock(&show_id, &entry.user_id).await;
            let known = cache
                .episode(&entry.episode_id)
                .await
                .and_then(|episode| episode.selection_for(&entry.user_id).cloned());
            if known
                .as_ref()
                .is_some_and(|selection| selection.observed_at >= entry.viewed_at)
            {
                continue;
            }

            let tracks = match client
                .get_track_selection(&entry.episode_id, &entry.user_id)
                .await
            {
                Ok(tracks) => tracks,
                Err(err) => {
                    debug!(target: "tracksync::reconciler", episode = %entry.episode_id, error = %err, "could not read tracks of watched episode");
                    continue;
                }
            };
            let Some(audio) = tracks.audio else {
                continue;
            };
            let selection = TrackSelection::observed(audio, tracks.subtitle, entry.viewed_at);
            if cache
                .record_selection(&entry.episode_id, &entry.user_id, selection)
                .await
                .is_ok()
            {
                report.history_observed += 1;
            }
            drop(guard);
        }
    }

    /// Pairs with an observation inside the lookback window, plus pairs
    /// queued after failed propagations.
    async fn active_pairs(&self, since: DateTime<Utc>) -> BTreeSet<(ShowId, UserId)> {
        let cache = self.engine.cache();
        let mut pairs: BTreeSet<(ShowId, UserId)> = cache.propagation_retries().into_iter().collect();

        for show_id in cache.show_ids() {
            let Some(show) = cache.show(&show_id).await else {
                continue;
            };
            if show.ignored {
                continue;
            }
            for episode in show.episodes() {
                for (user, selection) in &episode.selections {
                    if selection.is_observed() && selection.observed_at >= since {
                        pairs.insert((show_id.clone(), user.clone()));
                    }
                }
            }
        }
        pairs
    }

    /// Runs a pass at every occurrence of `schedule` until shutdown.
    pub async fn run_daily(self: Arc<Self>, schedule: DailySchedule) {
        info!(target: "tracksync::reconciler", at = %schedule, "scheduler started");
        loop {
            let wait = schedule.until_next();
            debug!(target: "tracksync::reconciler", seconds = wait.as_secs(), "sleeping until next pass");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            self.run_pass().await;
        }
        info!(target: "tracksync::reconciler", "scheduler stopped");
    }
}

/// Keeps the most recent view per (user, episode), oldest first.
fn latest_views(entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let mut latest: HashMap<(UserId, EpisodeId), HistoryEntry> = HashMap::new();
    for entry in entries {
        let key = (entry.user_id.clone(), entry.episode_id.clone());
        match latest.get(&key) {
            Some(existing) if existing.viewed_at >= entry.viewed_at => {}
            _ => {
                latest.insert(key, entry);
            }
        }
    }
    let mut views: Vec<HistoryEntry> = latest.into_values().collect();
    views.sort_by(|a, b| a.viewed_at.cmp(&b.viewed_at).then_with(|| a.episode_id.cmp(&b.episode_id)));
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn view(user: &str, episode: &str, secs: i64) -> HistoryEntry {
        HistoryEntry {
            user_id: UserId::new(user),
            episode_id: EpisodeId::new(episode),
            show_id: None,
            viewed_at: Utc.timestamp_opt(secs, 0).single().unwrap(),
        }
    }

    #[test]
    fn latest_views_collapses_rewatches() {
        let views = latest_views(vec![
            view("1", "e2", 30),
            view("1", "e1", 10),
            view("1", "e2", 20),
            view("2", "e2", 5),
        ]);
        let summary: Vec<_> = views
            .iter()
            .map(|v| (v.user_id.as_str(), v.episode_id.as_str(), v.viewed_at.timestamp()))
            .collect();
        assert_eq!(summary, vec![("2", "e2", 5), ("1", "e1", 10), ("1", "e2", 30)]);
    }
}
