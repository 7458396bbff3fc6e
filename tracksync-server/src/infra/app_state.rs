use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use tracksync_core::{EventRouter, InboundEvent, LibraryCache, MediaServerClient};

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<LibraryCache>,
    pub router: Arc<EventRouter>,
    pub client: Arc<dyn MediaServerClient>,
    /// Intake side of the router queue.
    pub events: mpsc::Sender<InboundEvent>,
    ready: Arc<AtomicBool>,
    pub started_at: DateTime<Utc>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<LibraryCache>,
        router: Arc<EventRouter>,
        client: Arc<dyn MediaServerClient>,
        events: mpsc::Sender<InboundEvent>,
    ) -> Self {
        Self {
            config,
            cache,
            router,
            client,
            events,
            ready: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Set once the startup refresh has finished.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}
