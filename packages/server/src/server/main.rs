// Main entry point for the provisioning service

use std::sync::Arc;

use anyhow::{Context, Result};
use server_core::kernel::instance::InstanceManager;
use server_core::kernel::jobs::{JobPublisher, JobStore, ProvisioningWorker, RedisJobStore};
use server_core::kernel::runtime::RuntimeClient;
use server_core::kernel::{cleanup, infra};
use server_core::server::{build_app, AppState};
use server_core::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting workflow-engine provisioning service");

    // Load configuration
    let config = Arc::new(Config::from_env().context("Failed to load configuration")?);
    tracing::info!("Configuration loaded");

    // Connect to the container daemon
    let runtime = Arc::new(RuntimeClient::connect().context("Failed to connect to Docker")?);

    // Provision shared infrastructure (network, proxy, Redis, broker,
    // fallback site, image pre-pull). Failures are logged, never fatal.
    infra::bootstrap(&runtime, &config).await;

    let instances = Arc::new(InstanceManager::new(runtime.clone(), config.clone()));

    // Re-sync env vars of instances created by an older build
    match instances.reconcile_all().await {
        Ok(0) => tracing::info!("No instances needed reconciliation"),
        Ok(rebuilt) => tracing::info!(rebuilt, "Instances reconciled"),
        Err(err) => tracing::warn!(error = %err, "Reconciliation skipped"),
    }

    let store: Arc<dyn JobStore> = Arc::new(
        RedisJobStore::new(&config.redis_url(), config.job_ttl, config.job_cleanup_ttl)
            .context("Failed to build job store")?,
    );
    let publisher = Arc::new(JobPublisher::new(config.amqp_addr()));

    // Background tasks: provisioning worker, then the eviction sweeper
    let worker_stop = CancellationToken::new();
    let worker = ProvisioningWorker::new(
        config.clone(),
        instances.clone(),
        runtime.clone(),
        store.clone(),
    )
    .context("Failed to build worker")?;
    let worker_handle = tokio::spawn(worker.run(worker_stop.clone()));

    let sweeper_stop = CancellationToken::new();
    let sweeper_handle = tokio::spawn(cleanup::run_sweeper(
        instances.clone(),
        config.clone(),
        sweeper_stop.clone(),
    ));

    // Build application
    let state = AppState {
        config: config.clone(),
        runtime: runtime.clone(),
        instances,
        store,
        publisher: publisher.clone(),
        http: reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?,
    };
    let app = build_app(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.server_port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.server_port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Teardown in reverse order: sweeper, worker, broker connection.
    tracing::info!("Shutting down");
    sweeper_stop.cancel();
    worker_stop.cancel();
    let _ = sweeper_handle.await;
    let _ = worker_handle.await;
    publisher.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
