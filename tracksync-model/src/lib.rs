//! Core data model definitions shared across tracksync crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod change;
pub mod error;
pub mod ids;
pub mod library;
pub mod policy;
pub mod selection;

// Intentionally curated re-exports for downstream consumers.
pub use change::{ChangeRecord, TriggerKind};
pub use error::{ModelError, Result as ModelResult};
pub use ids::{EpisodeId, LibraryId, PartId, SeasonId, ShowId, UserId};
pub use library::{Episode, Library, Season, SequencePosition, Show};
pub use policy::{UpdateLevel, UpdateStrategy};
pub use selection::{SelectionOrigin, TrackId, TrackSelection, UNDETERMINED_LANGUAGE};
