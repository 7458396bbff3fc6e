use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::{EpisodeId, ShowId, UserId};
use crate::library::SequencePosition;
use crate::selection::TrackSelection;

/// What caused a propagation. Also the event filter used by notification
/// routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TriggerKind {
    PlayOrActivity,
    NewEpisode,
    UpdatedEpisode,
    Scheduler,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 4] = [
        TriggerKind::PlayOrActivity,
        TriggerKind::NewEpisode,
        TriggerKind::UpdatedEpisode,
        TriggerKind::Scheduler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::PlayOrActivity => "play_or_activity",
            TriggerKind::NewEpisode => "new_episode",
            TriggerKind::UpdatedEpisode => "updated_episode",
            TriggerKind::Scheduler => "scheduler",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        TriggerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ModelError::InvalidTrigger(s.to_string()))
    }
}

/// One applied change: the unit handed to the notifier.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChangeRecord {
    pub user_id: UserId,
    pub show_id: ShowId,
    pub episode_id: EpisodeId,
    pub position: SequencePosition,
    pub source_episode: EpisodeId,
    pub previous: Option<TrackSelection>,
    pub applied: TrackSelection,
    pub trigger: TriggerKind,
    pub recorded_at: DateTime<Utc>,
}
