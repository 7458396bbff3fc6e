//! # tracksync
//!
//! Keeps each Plex user's audio and subtitle choice consistent across the
//! episodes of a show.
//!
//! A play (or a track change during playback) on one episode is copied to
//! the rest of the show according to the configured update level and
//! strategy. New episodes get the selection when a scan adds them, and a
//! daily reconciliation pass catches whatever the webhooks missed.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracksync_core::{
    ChangeBus, EventRouter, LibraryCache, MediaServerClient, Notifier, PropagationEngine,
    Reconciler, SnapshotStore,
};

use tracksync_model::UserId;
use tracksync_server::{
    create_app,
    infra::{
        app_state::AppState,
        config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
        notify::AppriseDispatch,
        plex::PlexClient,
        startup::{self, ProdStartupHooks, StartupHooks},
    },
};

/// Capacity of the in-process change bus.
const CHANGE_BUS_CAPACITY: usize = 256;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "tracksync")]
#[command(about = "Propagates Plex audio and subtitle selections across the episodes of a show")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the TOML config file
    #[arg(short, long, global = true, env = "TRACKSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, global = true, env = "TRACKSYNC_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration, print warnings and exit
    CheckConfig,
    /// Run one reconciliation pass and exit
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;

    match cli.command {
        Some(Command::CheckConfig) => {
            info!(
                url = %config.plex.url,
                users = config.plex.users.len(),
                discover_users = config.plex.discover_users,
                token = %config.metadata.token_source.describe(),
                "configuration is valid"
            );
            Ok(())
        }
        Some(Command::Reconcile) => run_reconcile_once(config).await,
        None => run_server(config).await,
    }
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<Arc<Config>> {
    let ConfigLoad {
        mut config,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host.clone() {
        config.server.host = host;
    }

    let default_filter = config.default_log_filter();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "loaded config file");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(hint = %hint, "{}", warning.message),
            None => warn!("{}", warning.message),
        }
    }

    Ok(Arc::new(config))
}

/// Everything that talks to Plex or owns library state.
struct Services {
    client: Arc<dyn MediaServerClient>,
    cache: Arc<LibraryCache>,
    store: SnapshotStore,
    engine: Arc<PropagationEngine>,
    /// Display names for notifications, configured ones winning over
    /// discovered ones.
    user_names: HashMap<UserId, String>,
}

async fn build_services(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Services> {
    let plex = Arc::new(PlexClient::new(&config.plex).context("failed to build Plex client")?);
    startup::connect(&plex, config).await?;

    let mut user_names = plex.discovered_names().await;
    user_names.extend(config.plex.user_names());

    let (cache, store) = startup::restore_cache(config).await?;
    let client: Arc<dyn MediaServerClient> = plex;
    let engine = Arc::new(PropagationEngine::new(
        Arc::clone(&cache),
        Arc::clone(&client),
        ChangeBus::new(CHANGE_BUS_CAPACITY),
        config.propagation.clone(),
        shutdown,
    ));

    Ok(Services {
        client,
        cache,
        store,
        engine,
        user_names,
    })
}

fn build_notifier(
    config: &Config,
    user_names: HashMap<UserId, String>,
) -> anyhow::Result<Option<Notifier>> {
    if !config.notifications.is_active() {
        return Ok(None);
    }
    let dispatch =
        AppriseDispatch::new(config.plex.request_timeout).context("failed to build notifier")?;
    Ok(Some(
        Notifier::new(config.notifications.routes.clone(), Arc::new(dispatch))
            .with_user_names(user_names),
    ))
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    if !config.startup_delay.is_zero() {
        info!(delay = ?config.startup_delay, "waiting before connecting to Plex");
        tokio::time::sleep(config.startup_delay).await;
    }

    let shutdown = CancellationToken::new();
    let Services {
        client,
        cache,
        store,
        engine,
        user_names,
    } = build_services(&config, shutdown.clone()).await?;

    let router = Arc::new(EventRouter::new(Arc::clone(&engine), config.triggers));
    let (events_tx, events_rx) = mpsc::channel(config.server.event_queue.max(1));
    let state = AppState::new(
        Arc::clone(&config),
        Arc::clone(&cache),
        Arc::clone(&router),
        client,
        events_tx,
    );

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(Arc::clone(&router).run(events_rx, shutdown.clone())));

    if let Some(notifier) = build_notifier(&config, user_names)? {
        tasks.push(tokio::spawn(notifier.run(engine.bus().subscribe(), shutdown.clone())));
    }

    if config.scheduler.enable {
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&engine),
            config.scheduler.reconciler.clone(),
            shutdown.clone(),
        ));
        tasks.push(tokio::spawn(reconciler.run_daily(config.scheduler.schedule)));
    } else {
        info!("scheduler disabled");
    }

    tasks.push(startup::spawn_snapshot_task(
        Arc::clone(&cache),
        store.clone(),
        config.snapshot_interval,
        shutdown.clone(),
    ));

    let hook_state = state.clone();
    let hook_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if let Err(err) = ProdStartupHooks.run(hook_engine, &hook_state).await {
            error!(error = %err, "startup hooks failed");
        }
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "tracksync listening");

    let signal_token = shutdown.clone();
    axum::serve(listener, create_app(state))
        .with_graceful_shutdown(async move {
            startup::shutdown_signal().await;
            signal_token.cancel();
        })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }

    match cache.persist_if_dirty(&store).await {
        Ok(true) => info!("cache snapshot saved"),
        Ok(false) => {}
        Err(err) => error!(error = %err, "final cache snapshot failed"),
    }
    info!("tracksync stopped");
    Ok(())
}

async fn run_reconcile_once(config: Arc<Config>) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let Services {
        cache,
        store,
        engine,
        user_names,
        ..
    } = build_services(&config, shutdown.clone()).await?;

    let mut changes = engine.bus().subscribe();
    let reconciler = Reconciler::new(
        Arc::clone(&engine),
        config.scheduler.reconciler.clone(),
        shutdown,
    );
    let report = reconciler.run_pass().await;

    if let Some(notifier) = build_notifier(&config, user_names)? {
        loop {
            match changes.try_recv() {
                Ok(batch) => {
                    notifier.notify(&batch).await;
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change batches dropped before notification");
                }
                Err(_) => break,
            }
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render report")?
    );

    cache
        .persist_if_dirty(&store)
        .await
        .context("failed to save cache snapshot")?;
    Ok(())
}
