//! Core of tracksync: the library cache, scope resolution, and the
//! propagation engine that copies a user's audio and subtitle choice across
//! the episodes of a show.
//!
//! The crate is transport agnostic. Everything it knows about the media
//! server goes through [`MediaServerClient`], and everything it produces
//! leaves as [`ChangeBatch`]es on the [`ChangeBus`].

pub mod cache;
pub mod client;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod reconciler;
pub mod resolver;
pub mod router;
pub mod schedule;

pub use cache::{
    CacheSnapshot, CacheSummary, EpisodeRef, IgnoreFilter, LibraryCache, RefreshFailure,
    RefreshReport, RefreshScope, SnapshotStore, UpsertOutcome,
};
pub use client::{
    EpisodeListing, HistoryEntry, LibraryListing, MediaServerClient, SeasonListing,
    SelectedTracks, ShowListing,
};
pub use engine::{
    Execution, PairGuard, PairLocks, PropagationConfig, PropagationEngine, PropagationOutcome,
    PropagationRequest, PropagationSource, RefreshPropagation, TargetFailure,
};
pub use error::{Result, SyncError};
pub use notifier::{
    ChangeBatch, ChangeBus, Notification, NotificationDispatch, NotificationRoute, Notifier,
};
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use router::{EventRouter, InboundEvent, PlaybackEvent, RouteOutcome, ScanEvent, TriggerPolicy};
pub use schedule::DailySchedule;

pub use tracksync_model as model;
