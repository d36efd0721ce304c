//! Composition root: wires configuration, stores, providers and the
//! background tasks together and runs them until a shutdown signal.

use crate::api::ApiServer;
use crate::error::{PermsSyncError, PermsSyncResult};
use crate::providers::{build_providers, rate_limiters_for, validate_connections};
use crate::scheduler::PermsScheduler;
use crate::syncer::{PermsSyncer, Stores};
use crate::worker::{Resetter, SyncJobHandler, Worker, WorkerOptions};
use authz::{AuthzSnapshot, ProviderRegistry};
use config::{DatabaseConfig, PermsSyncConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use storage::{MemoryStore, PostgresStore, SyncJobStore};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Runs the permissions sync service until Ctrl+C or SIGTERM.
pub async fn run(config: PermsSyncConfig) -> PermsSyncResult<()> {
    if config.observability.metrics_enabled {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.observability.metrics_port))
            .install()
            .map_err(|e| PermsSyncError::Server(format!("Failed to install metrics exporter: {e}")))?;
        info!(port = config.observability.metrics_port, "Prometheus exporter listening");
    }

    let (stores, jobs) = connect_stores(&config.database).await?;

    let build = build_providers(&config);
    let failures = validate_connections(&build.providers).await;
    if !failures.is_empty() {
        warn!(failures = ?failures, "Some code host connections failed validation");
    }
    let registry = Arc::new(ProviderRegistry::new(AuthzSnapshot::new(
        build.allow_access_by_default,
        build.providers
    )));

    let syncer = Arc::new(
        PermsSyncer::new(stores, registry, &config.syncer)
            .with_rate_limiters(rate_limiters_for(&config))
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(Arc::clone(&syncer).run(shutdown_rx.clone()));

    let mut scheduler = None;
    if config.scheduler.enabled {
        let perms_scheduler = PermsScheduler::new(Arc::clone(&syncer), &config.scheduler).await?;
        perms_scheduler.start().await?;
        if let Err(e) = perms_scheduler.run_now().await {
            error!(error = %e, "Initial permissions sync scheduling failed");
        }
        scheduler = Some(perms_scheduler);
    }

    if config.worker.enabled {
        let worker = Arc::new(Worker::new(
            Arc::clone(&jobs),
            Arc::new(SyncJobHandler::new(Arc::clone(&syncer))),
            WorkerOptions::from_config(&config.worker)
        ));
        tasks.spawn(worker.run(shutdown_rx.clone()));
        tasks.spawn(Resetter::new(jobs, &config.worker).run(shutdown_rx.clone()));
    }

    if config.api.enabled {
        ApiServer::new(Arc::clone(&syncer), &config.api.host, config.api.port)?
            .run(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    info!("Shutting down permissions sync service");
    let _ = shutdown_tx.send(true);
    if let Some(mut scheduler) = scheduler {
        scheduler.stop().await?;
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Background task panicked");
        }
    }
    info!("Permissions sync service stopped");
    Ok(())
}

async fn connect_stores(
    config: &DatabaseConfig
) -> PermsSyncResult<(Stores, Arc<dyn SyncJobStore>)> {
    if !config.enabled {
        warn!("Database disabled, permissions are kept in memory only");
        let store = MemoryStore::new();
        return Ok((Stores::from_backend(store.clone()), Arc::new(store)));
    }

    let store = PostgresStore::connect_with(&config.connection_url(), config.pool_size).await?;
    store.initialize_schema().await?;
    info!(pool_size = config.pool_size, "Connected to PostgreSQL");
    Ok((Stores::from_backend(store.clone()), Arc::new(store)))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        () = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}

/// Loads configuration from `PS_CONFIG` and `PS_*` variables, initializes
/// logging and runs the service.
pub async fn run_from_env() -> PermsSyncResult<()> {
    let config = config::load(None)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.observability.logging_level))
        )
        .init();

    run(config).await
}
