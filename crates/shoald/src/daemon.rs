//! Assembles every Shoal subsystem into one process.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info};

use shoal_api::{Operator, build_router};
use shoal_autoscale::Autoscaler;
use shoal_config::ConfigPropagator;
use shoal_controller::{ControllerRunner, ProcessDriver, WorkQueue, WorkloadController};
use shoal_health::{HealthBook, HealthMonitor, HttpProber};
use shoal_metrics::HttpMetricSource;
use shoal_proxy::{EndpointRegistry, Ingress, ProxyServer, ServiceRouter};
use shoal_state::{ResourceKind, StateStore};

use crate::config::ShoaldConfig;

/// Open the state store and check every persisted workload.
///
/// A workload record that no longer deserializes or validates is fatal:
/// reconciling it would act on a declaration nobody wrote.
pub fn open_store(path: &Path) -> anyhow::Result<StateStore> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let state = StateStore::open(path).context("failed to open state store")?;
    let workloads = state
        .list_workloads()
        .context("persisted workloads are unreadable")?;
    for spec in &workloads {
        spec.validate()
            .with_context(|| format!("persisted workload {} is invalid", spec.id()))?;
    }
    info!(path = ?path, workloads = workloads.len(), "state store opened");
    Ok(state)
}

/// Run the daemon until `shutdown_signal` resolves.
pub async fn run(
    config: ShoaldConfig,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("Shoal daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let state = open_store(&config.db_path())?;

    let registry = EndpointRegistry::new();
    let router = Arc::new(ServiceRouter::new(registry.clone(), config.proxy.balance));
    let ingress = Arc::new(Ingress::new(router));
    let book = HealthBook::new();
    let queue = Arc::new(WorkQueue::new());

    let operator = Operator::new(state.clone(), queue.clone(), ingress.clone());
    let routes = operator.reload_routes()?;
    info!(routes, strategy = ?config.proxy.balance, "ingress loaded");

    let ports = config.instances.port_range_start..=config.instances.port_range_end;
    let driver = ProcessDriver::new(config.instances.host.clone(), ports)
        .with_stop_grace(Duration::from_secs(config.instances.stop_grace_secs));
    driver.reserve_existing(&state.list_instances()?);

    let controller = Arc::new(WorkloadController::new(
        state.clone(),
        registry.clone(),
        book.clone(),
        Arc::new(driver),
        config.controller.clone(),
    ));
    let restored = controller.restore_endpoints()?;
    info!(endpoints = restored, "endpoint registry restored");

    let runner = ControllerRunner::new(
        controller,
        queue.clone(),
        Duration::from_secs(config.loops.resync_secs),
    )
    .with_workers(config.loops.workers);
    let enqueued = runner.enqueue_all()?;
    info!(workloads = enqueued, workers = config.loops.workers, "controller initialized");

    let monitor = HealthMonitor::new(
        state.clone(),
        book,
        registry,
        Arc::new(HttpProber),
        Duration::from_secs(config.loops.health_interval_secs),
    );

    let source = HttpMetricSource::new()
        .with_path(config.metrics.path.clone())
        .with_gauge(ResourceKind::Cpu, config.metrics.cpu_gauge.clone())
        .with_gauge(ResourceKind::Memory, config.metrics.memory_gauge.clone());
    let scale_queue = queue.clone();
    let autoscaler = Autoscaler::new(state.clone(), Arc::new(source), config.autoscaler.clone())
        .with_scale_fn(Box::new(move |id| scale_queue.add(id)));
    info!(interval = config.autoscaler.interval_secs, "autoscaler initialized");

    let config_queue = queue.clone();
    let propagator = ConfigPropagator::new(state.clone())
        .with_reconcile_fn(Box::new(move |id| config_queue.add(id)));
    let propagate_interval = Duration::from_secs(config.loops.propagate_interval_secs);

    let proxy = ProxyServer::bind(config.proxy_listen, ingress, config.upstream_timeout()).await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let controller_shutdown = shutdown_rx.clone();
    let controller_handle = tokio::spawn(async move {
        runner.run(controller_shutdown).await;
    });

    let health_shutdown = shutdown_rx.clone();
    let health_handle = tokio::spawn(async move {
        monitor.run(health_shutdown).await;
    });

    let autoscale_shutdown = shutdown_rx.clone();
    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(autoscale_shutdown).await;
    });

    let config_shutdown = shutdown_rx.clone();
    let config_handle = tokio::spawn(async move {
        propagator.run(propagate_interval, config_shutdown).await;
    });

    let proxy_shutdown = shutdown_rx.clone();
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(proxy_shutdown).await {
            error!(error = %e, "proxy server failed");
        }
    });

    // ── Start API server ───────────────────────────────────────

    let api = build_router(operator);
    info!(addr = %config.api_listen, "API server starting");
    let listener = tokio::net::TcpListener::bind(config.api_listen)
        .await
        .with_context(|| format!("failed to bind API listener on {}", config.api_listen))?;

    let server = axum::serve(listener, api).with_graceful_shutdown(async move {
        shutdown_signal.await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = controller_handle.await;
    let _ = health_handle.await;
    let _ = autoscale_handle.await;
    let _ = config_handle.await;
    let _ = proxy_handle.await;

    info!("Shoal daemon stopped");
    Ok(())
}
