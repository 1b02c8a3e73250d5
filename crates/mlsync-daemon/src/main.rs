use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use mlsync_ampre::AmpreClient;
use mlsync_core::{MlsyncConfig, SyncType};
use mlsync_executor::{RunOutcome, SyncExecutor, SyncRequest, SyncSettings};
use mlsync_scheduler::{FiredTrigger, SchedulerEngine, SchedulerHandle, TriggerTable};
use mlsync_store::ListingStore;

mod app;
mod cli;
mod dispatch;
mod http;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mlsync_daemon=info,mlsync_executor=info,mlsync_scheduler=info,\
                 mlsync_store=info,mlsync_ampre=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > MLSYNC_CONFIG env > ~/.mlsync/mlsync.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("MLSYNC_CONFIG").ok());
    let config = resolve_config(config_path.as_deref(), &cli.command)?;

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    let store = ListingStore::open(&db_path)
        .with_context(|| format!("failed to open database at {db_path}"))?;

    match cli.command {
        Commands::Serve => serve(config, store).await,
        Commands::Sync {
            sync_type,
            limit,
            skip_existing,
            overwrite_media,
        } => {
            let skip_existing = skip_existing
                || (sync_type == SyncType::ImageRefresh
                    && config.schedule.image_skip_existing
                    && !overwrite_media);
            let req = SyncRequest {
                sync_type,
                limit: limit.unwrap_or(config.sync.record_limit),
                skip_existing,
            };
            sync_once(&config, store, req).await
        }
        Commands::Status { runs } => {
            let scheduler = SchedulerHandle::new(rusqlite::Connection::open(&db_path)?)?;
            let snapshot = http::status::build_snapshot(&store, Some(&scheduler), runs)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Commands::ResetCursor { sync_type, offset } => {
            let cursor = store.reset_cursor(sync_type, offset)?;
            println!("{}", serde_json::to_string_pretty(&cursor)?);
            Ok(())
        }
    }
}

fn build_executor(config: &MlsyncConfig, store: ListingStore) -> anyhow::Result<SyncExecutor<AmpreClient>> {
    let client = AmpreClient::new(&config.ampre)?;
    info!(base_url = %config.ampre.base_url, feed = ?config.ampre.feed, "AMPRE client ready");
    Ok(SyncExecutor::new(client, store, SyncSettings::from_config(config)))
}

async fn sync_once(config: &MlsyncConfig, store: ListingStore, req: SyncRequest) -> anyhow::Result<()> {
    let executor = build_executor(config, store)?;
    let outcome = executor.run(req).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if let RunOutcome::Failed(log) = outcome {
        bail!(
            "{} sync failed: {}",
            log.sync_type,
            log.message.unwrap_or_default()
        );
    }
    Ok(())
}

async fn serve(config: MlsyncConfig, store: ListingStore) -> anyhow::Result<()> {
    let db_path = config.database.path.clone();
    let table = TriggerTable::from_config(&config.schedule)?;

    // Fired-trigger channel: SchedulerEngine → dispatcher task
    let (fired_tx, fired_rx) = tokio::sync::mpsc::channel::<FiredTrigger>(64);

    // scheduler: read handle for /status + engine for the background loop
    let mut engine = SchedulerEngine::new(rusqlite::Connection::open(&db_path)?, Some(fired_tx))?;
    engine.reconcile(&table)?;
    let scheduler_handle = SchedulerHandle::new(rusqlite::Connection::open(&db_path)?)?;
    for state in scheduler_handle.list_triggers()? {
        info!(
            trigger = %state.trigger.name,
            schedule = %state.trigger.schedule,
            limit = state.trigger.limit,
            next_run = ?state.next_run,
            "trigger armed"
        );
    }

    let executor = Arc::new(build_executor(&config, store.clone())?);
    let dispatcher = dispatch::spawn(executor, fired_rx);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));

    let status_task = if config.status.enabled {
        let state = Arc::new(app::AppState::new(
            store,
            Some(scheduler_handle),
            Duration::from_secs(config.sync.cache_ttl_secs),
        ));
        let router = app::build_router(state);
        let addr: SocketAddr = format!("{}:{}", config.status.bind, config.status.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("mlsync status endpoint listening on {}", addr);

        let mut rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!("status server error: {e}");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");

    // signal scheduler and status server to stop; the dispatcher drains
    // in-flight runs once the engine drops its sender
    let _ = shutdown_tx.send(true);
    engine_task.await?;
    dispatcher.await?;
    if let Some(task) = status_task {
        task.await?;
    }
    info!("mlsyncd stopped");
    Ok(())
}

/// A missing file already yields defaults inside `load`. A file that fails to
/// parse or validate is fatal for commands that call AMPRE; status and cursor
/// resets fall back to defaults.
fn resolve_config(path: Option<&str>, command: &Commands) -> anyhow::Result<MlsyncConfig> {
    match MlsyncConfig::load(path) {
        Ok(config) => Ok(config),
        Err(e) if command.needs_feed() => {
            Err(e).context(format!("invalid configuration ({})", path.unwrap_or("default path")))
        }
        Err(e) => {
            warn!("Config load failed ({}), using defaults", e);
            Ok(MlsyncConfig::default())
        }
    }
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
