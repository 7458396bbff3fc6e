use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tracksync_core::{LibraryCache, PropagationEngine, RefreshScope, SnapshotStore, SyncError};
use tracksync_model::TriggerKind;

use crate::infra::{app_state::AppState, config::Config, plex::PlexClient};

/// Work run after the listener is bound and before the service reports
/// ready.
#[async_trait]
pub trait StartupHooks: Send + Sync {
    async fn run(&self, engine: Arc<PropagationEngine>, state: &AppState) -> Result<()>;
}

/// Full library refresh, then new-episode propagation for whatever appeared
/// while the service was down.
#[derive(Debug, Default)]
pub struct ProdStartupHooks;

#[async_trait]
impl StartupHooks for ProdStartupHooks {
    async fn run(&self, engine: Arc<PropagationEngine>, state: &AppState) -> Result<()> {
        let report = state
            .cache
            .refresh(&RefreshScope::All, state.client.as_ref())
            .await;
        info!(
            target: "tracksync::startup",
            added = report.added.len(),
            updated = report.updated.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "initial library refresh finished"
        );
        if !report.is_clean() {
            warn!(
                target: "tracksync::startup",
                failed = report.failed.len(),
                "some scopes failed to refresh, the reconciler will retry them"
            );
        }

        let propagated = engine
            .propagate_refresh(&report, TriggerKind::NewEpisode, TriggerKind::UpdatedEpisode)
            .await;
        if propagated.requests > 0 {
            info!(
                target: "tracksync::startup",
                requests = propagated.requests,
                changes = propagated.changes,
                failed = propagated.failed,
                "caught up on episodes added while offline"
            );
        }

        state.mark_ready();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopStartupHooks;

#[async_trait]
impl StartupHooks for NoopStartupHooks {
    async fn run(&self, _engine: Arc<PropagationEngine>, state: &AppState) -> Result<()> {
        state.mark_ready();
        Ok(())
    }
}

/// Waits for the media server to answer. Rejected credentials fail at once;
/// everything else is retried up to the configured attempt count.
pub async fn connect(client: &PlexClient, config: &Config) -> Result<()> {
    let attempts = config.plex.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match client.identity().await {
            Ok(identity) => {
                info!(
                    target: "tracksync::startup",
                    machine = %identity.machine_identifier,
                    version = %identity.version,
                    "connected to Plex"
                );
                return Ok(());
            }
            Err(err @ SyncError::Configuration(_)) => {
                return Err(err).context("Plex rejected the configured token");
            }
            Err(err) if attempt >= attempts => {
                return Err(err)
                    .with_context(|| format!("Plex unreachable after {attempts} attempt(s)"));
            }
            Err(err) => {
                warn!(
                    target: "tracksync::startup",
                    attempt,
                    attempts,
                    retry_in = ?config.plex.connect_retry,
                    error = %err,
                    "Plex not reachable yet"
                );
                tokio::time::sleep(config.plex.connect_retry).await;
                attempt += 1;
            }
        }
    }
}

/// Rebuilds the cache from the stored snapshot, or starts empty.
pub async fn restore_cache(config: &Config) -> Result<(Arc<LibraryCache>, SnapshotStore)> {
    config
        .ensure_directories()
        .with_context(|| format!("failed to create {}", config.cache_dir().display()))?;
    let store = SnapshotStore::new(config.cache_dir());
    let cache = match store.load().await {
        Ok(Some(snapshot)) => {
            info!(
                target: "tracksync::startup",
                shows = snapshot.shows.len(),
                saved_at = %snapshot.saved_at,
                "restored library cache from snapshot"
            );
            LibraryCache::from_snapshot(snapshot, config.ignore_filter())
        }
        Ok(None) => LibraryCache::new(config.ignore_filter()),
        Err(err) => {
            warn!(target: "tracksync::startup", error = %err, "cache snapshot unreadable, starting empty");
            LibraryCache::new(config.ignore_filter())
        }
    };
    Ok((Arc::new(cache), store))
}

/// Writes the cache at every `interval` while it is dirty.
pub fn spawn_snapshot_task(
    cache: Arc<LibraryCache>,
    store: SnapshotStore,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = cache.persist_if_dirty(&store).await {
                        warn!(target: "tracksync::startup", error = %err, "periodic cache snapshot failed");
                    }
                }
            }
        }
    })
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
