use std::sync::Arc;

use anyhow::Context;
use sea_orm_migration::MigratorTrait;
use zonekeep_api::asset_cache::{AssetCache, SystemClock};
use zonekeep_api::config::{ConsoleConfig, ServerConfig};
use zonekeep_api::console_http;
use zonekeep_api::launcher::SystemLauncher;
use zonekeep_api::logging;
use zonekeep_api::process_table::{ProcessTable, SystemProcessTable};
use zonekeep_api::reconciler::Reconciler;
use zonekeep_api::registry::{LivenessPolicy, SessionRegistry};
use zonekeep_api::session_store::SessionStore;
use zonekeep_api::signature::ConsoleSignature;
use zonekeep_api::state::{AppState, console_client};
use zonekeep_api::supervisor::{Collaborators, ConsoleSupervisor};
use zonekeep_api::zones::ZoneadmInventory;

async fn init_state(server: &ServerConfig, config: ConsoleConfig) -> anyhow::Result<(AppState, Reconciler)> {
    let db = zonekeep_db::connect(&server.database_url)
        .await
        .context("connect database")?;

    // Apply migrations on boot (idempotent).
    zonekeep_migration::Migrator::up(&db, None)
        .await
        .context("apply migrations")?;

    let store = SessionStore::new(Arc::new(db));
    let processes: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new(
        config.elevate_command.clone(),
        config.command_timeout,
    ));
    let signature = ConsoleSignature::new(config.console_command.clone());

    let registry = SessionRegistry::new(
        &config.marker_dir,
        config.bind_address.clone(),
        processes.clone(),
        LivenessPolicy {
            grace: config.grace_window,
            probe_timeout: config.probe_timeout,
        },
    );
    let cache = Arc::new(AssetCache::new(
        config.cache_capacity,
        config.cache_ttl,
        config.cache_max_asset_bytes,
        Arc::new(SystemClock),
    ));

    let supervisor = ConsoleSupervisor::new(
        &config,
        Collaborators {
            inventory: Arc::new(ZoneadmInventory::new(config.command_timeout)),
            processes: processes.clone(),
            launcher: Arc::new(SystemLauncher::new(
                signature.clone(),
                config.elevate_command.clone(),
            )),
        },
        registry.clone(),
        store.clone(),
        cache.clone(),
    )?;

    let reconciler = Reconciler::new(
        processes,
        signature,
        registry.clone(),
        store.clone(),
        config.idle_timeout,
        config.sweep_interval,
    );

    let http = console_client(config.upstream_timeout)?;
    let state = AppState {
        config: Arc::new(config),
        supervisor,
        registry,
        store,
        cache,
        http,
        api_key: server.api_key.as_deref().map(Arc::from),
    };
    Ok((state, reconciler))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(%err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server = ServerConfig::from_env()?;
    let _log_guard = logging::init(server.log_dir.as_deref());
    let config = ConsoleConfig::from_env()?;
    let autostart = config.autostart;

    let (state, reconciler) = init_state(&server, config).await?;

    if let Err(err) = state.registry.cleanup_stale_sessions().await {
        tracing::warn!(%err, "console marker cleanup failed");
    }
    match reconciler.startup_sweep().await {
        Ok(report) => tracing::info!(
            orphans_killed = report.orphans_killed,
            demoted = report.demoted,
            abandoned = report.abandoned,
            "console startup sweep"
        ),
        Err(err) => tracing::warn!(%err, "console startup sweep failed"),
    }
    reconciler.spawn();

    if autostart {
        let supervisor = state.supervisor.clone();
        tokio::spawn(async move {
            match supervisor.autostart().await {
                Ok(started) => tracing::info!(started, "console autostart finished"),
                Err(err) => tracing::warn!(%err, "console autostart failed"),
            }
        });
    }

    let app = console_http::router(state);
    let addr = server.listen_addr;
    tracing::info!(%addr, "zonekeep HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
