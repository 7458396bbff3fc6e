//! Change fan-out and user notifications.
//!
//! The engine publishes one [`ChangeBatch`] per propagation that changed at
//! least one episode. The [`Notifier`] turns each batch into a
//! [`Notification`] and hands it to every matching route.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tracksync_model::{
    ChangeRecord, EpisodeId, SequencePosition, ShowId, TrackSelection, TriggerKind, UserId,
};

use crate::error::Result;

/// Changes applied by one propagation for one (show, user) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub batch_id: Uuid,
    pub show_id: ShowId,
    pub show_title: String,
    pub user_id: UserId,
    pub trigger: TriggerKind,
    pub source_episode: EpisodeId,
    pub selection: TrackSelection,
    /// Positions of every resolved target, changed or not.
    pub targets: Vec<SequencePosition>,
    pub changes: Vec<ChangeRecord>,
    pub failed: usize,
}

impl ChangeBatch {
    /// `S01E02 - S01E05`, or a single position when the range collapses.
    pub fn target_range(&self) -> Option<String> {
        position_range(&self.targets)
    }
}

fn position_range(positions: &[SequencePosition]) -> Option<String> {
    let first = positions.iter().min()?;
    let last = positions.iter().max()?;
    if first == last {
        Some(first.to_string())
    } else {
        Some(format!("{first} - {last}"))
    }
}

/// In-process broadcast of change batches.
#[derive(Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<ChangeBatch>,
    capacity: usize,
}

impl fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers that received the batch.
    pub fn publish(&self, batch: ChangeBatch) -> usize {
        match self.sender.send(batch) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("change batch dropped, no subscribers");
                0
            }
        }
    }
}

/// One rendered notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub trigger: TriggerKind,
    pub user_id: UserId,
}

/// Where notifications go. Empty `users` makes the route global and empty
/// `events` matches every trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRoute {
    pub targets: Vec<String>,
    #[serde(default)]
    pub users: BTreeSet<UserId>,
    #[serde(default)]
    pub events: BTreeSet<TriggerKind>,
}

impl NotificationRoute {
    pub fn global(targets: Vec<String>) -> Self {
        Self {
            targets,
            ..Self::default()
        }
    }

    pub fn matches(&self, user: &UserId, trigger: TriggerKind) -> bool {
        (self.users.is_empty() || self.users.contains(user))
            && (self.events.is_empty() || self.events.contains(&trigger))
    }
}

/// Outward delivery of a notification to a set of target URLs.
#[async_trait]
pub trait NotificationDispatch: Send + Sync {
    async fn dispatch(&self, targets: &[String], notification: &Notification) -> Result<()>;
}

pub struct Notifier {
    routes: Vec<NotificationRoute>,
    dispatch: Arc<dyn NotificationDispatch>,
    user_names: HashMap<UserId, String>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("routes", &self.routes.len())
            .field("known_users", &self.user_names.len())
            .finish()
    }
}

impl Notifier {
    pub fn new(routes: Vec<NotificationRoute>, dispatch: Arc<dyn NotificationDispatch>) -> Self {
        Self {
            routes,
            dispatch,
            user_names: HashMap::new(),
        }
    }

    /// Display names used in notification bodies instead of raw account ids.
    pub fn with_user_names(mut self, names: HashMap<UserId, String>) -> Self {
        self.user_names = names;
        self
    }

    pub fn routes(&self) -> &[NotificationRoute] {
        &self.routes
    }

    /// Renders `batch`; batches without changes produce nothing.
    ///
    /// Play and scheduler batches summarise the selection and the episodes
    /// it reached. New and replaced episode batches name the episodes that
    /// received a selection.
    pub fn render(&self, batch: &ChangeBatch) -> Option<Notification> {
        if batch.changes.is_empty() {
            return None;
        }

        let user = self
            .user_names
            .get(&batch.user_id)
            .map(String::as_str)
            .unwrap_or(batch.user_id.as_str());

        let (title, body) = match batch.trigger {
            TriggerKind::NewEpisode | TriggerKind::UpdatedEpisode => {
                let status = if batch.trigger == TriggerKind::NewEpisode {
                    "New"
                } else {
                    "Updated"
                };
                let positions: Vec<SequencePosition> =
                    batch.changes.iter().map(|change| change.position).collect();
                let episode = match position_range(&positions) {
                    Some(range) => format!("{} ({range})", batch.show_title),
                    None => batch.show_title.clone(),
                };
                (
                    format!("{status}: {episode}"),
                    format!("Episode: {episode}\nStatus: {status} episode\nUpdated for {user}"),
                )
            }
            TriggerKind::PlayOrActivity | TriggerKind::Scheduler => {
                let subtitles = batch
                    .selection
                    .subtitle
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "None".to_string());
                let updated: BTreeSet<&EpisodeId> =
                    batch.changes.iter().map(|change| &change.episode_id).collect();
                let range = batch.target_range().unwrap_or_else(|| "-".to_string());
                (
                    batch.show_title.clone(),
                    format!(
                        "Show: {show}\nUser: {user}\nAudio: {audio}\nSubtitles: {subtitles}\nUpdated episodes: {updated}/{total} ({range})",
                        show = batch.show_title,
                        audio = batch.selection.audio,
                        updated = updated.len(),
                        total = batch.targets.len(),
                    ),
                )
            }
        };

        Some(Notification {
            title,
            body,
            trigger: batch.trigger,
            user_id: batch.user_id.clone(),
        })
    }

    /// Sends `batch` to every matching route and returns how many routes
    /// accepted it. Dispatch failures are logged per route.
    pub async fn notify(&self, batch: &ChangeBatch) -> usize {
        let Some(notification) = self.render(batch) else {
            return 0;
        };

        let mut delivered = 0;
        for route in self
            .routes
            .iter()
            .filter(|route| route.matches(&batch.user_id, batch.trigger))
        {
            match self.dispatch.dispatch(&route.targets, &notification).await {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    batch = %batch.batch_id,
                    targets = route.targets.len(),
                    error = %err,
                    "notification dispatch failed"
                ),
            }
        }
        delivered
    }

    /// Consumes the change bus until it closes or `shutdown` fires.
    pub async fn run(self, mut changes: broadcast::Receiver<ChangeBatch>, shutdown: CancellationToken) {
        info!(routes = self.routes.len(), "notifier started");
        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = changes.recv() => received,
            };
            match batch {
                Ok(batch) => {
                    let delivered = self.notify(&batch).await;
                    debug!(batch = %batch.batch_id, delivered, "change batch handled");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notifier lagged behind the change bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("notifier stopped");
    }
}
