//! Portal Control Plane
//!
//! The control plane accepts cluster and deployment intents over REST,
//! drives them to completion against the cluster-management API, and
//! serves aggregated metrics for the resources it manages.

use std::sync::Arc;

use anyhow::{Context, Result};
use portal_control_plane::{
    adapter::{Adapter, HttpResourceClient, ResourceClient, SimulatedClient},
    api, config,
    metrics::{MetricsStore, MetricsWorker},
    operations::OperationTracker,
    reconciler::{ReconcileWorker, Reconciler},
    service::OrchestrationService,
    state::{AppState, Heartbeat, WorkerProbe},
    store::ResourceStore,
};
use portal_reconcile::{AttemptBudget, BackoffPolicy};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTAL_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portal control plane");
    info!(
        listen_addr = %config.listen_addr,
        dev_mode = config.dev_mode,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        metrics_interval_secs = config.metrics_interval.as_secs(),
        "Configuration loaded"
    );

    // Provider client
    let client: Arc<dyn ResourceClient> = match &config.provider.url {
        Some(url) if !config.dev_mode => {
            info!(provider_url = %url, "Using HTTP provider");
            Arc::new(
                HttpResourceClient::new(url.clone(), config.provider.token.clone())
                    .context("failed to build provider client")?,
            )
        }
        _ => {
            warn!("Dev mode: using the simulated provider");
            Arc::new(SimulatedClient::new())
        }
    };
    let adapter = Adapter::new(client, config.provider.timeout);

    // Shared tables
    let resources = Arc::new(ResourceStore::new());
    let tracker = Arc::new(OperationTracker::new(
        AttemptBudget::new(config.max_attempts),
        BackoffPolicy::new(config.backoff_base, config.backoff_max),
    ));
    let metrics = Arc::new(MetricsStore::new(config.metrics_capacity));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start reconciliation worker in background
    let reconcile_heartbeat = Arc::new(Heartbeat::new());
    let reconcile_worker = ReconcileWorker::new(
        Reconciler::new(resources.clone(), tracker.clone(), adapter.clone()),
        config.reconcile_interval,
        config.operation_retention,
        reconcile_heartbeat.clone(),
    );
    let reconcile_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconcile_worker.run(shutdown_rx).await;
        }
    });

    // Start metrics aggregator in background
    let metrics_heartbeat = Arc::new(Heartbeat::new());
    let metrics_worker = MetricsWorker::new(
        resources.clone(),
        metrics.clone(),
        adapter.clone(),
        config.metrics_interval,
        metrics_heartbeat.clone(),
    );
    let metrics_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            metrics_worker.run(shutdown_rx).await;
        }
    });

    // Create application state
    let service = Arc::new(OrchestrationService::new(
        resources,
        tracker,
        metrics,
        adapter,
        config.lock_timeout,
    ));
    let state = AppState::new(
        service,
        WorkerProbe::new(reconcile_heartbeat, config.reconcile_interval),
        WorkerProbe::new(metrics_heartbeat, config.metrics_interval),
    );

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, reconcile_handle).await {
        warn!(error = %e, "Reconciliation worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, metrics_handle).await {
        warn!(error = %e, "Metrics aggregator did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
