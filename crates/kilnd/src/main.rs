use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kiln_autoscale::Downscaler;
use kiln_build::{BuildDispatcher, BuildService};
use kiln_cluster::{ClusterApi, KubeCluster};
use kiln_core::{EngineConnector, ImageInspector, KilnConfig};
use kiln_discovery::{WorkerDiscoverer, holder_base};
use kiln_metrics::BuildMetrics;
use kilnd::{AppState, Cli, Settings, UnlinkedEngine, build_router};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kilnd=debug,kiln=debug")),
        )
        .init();

    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => KilnConfig::from_file(path)?,
        None => KilnConfig::default(),
    };
    let settings = Settings::resolve(&cli, &file)?;

    run(settings).await
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!(port = settings.port, "kiln daemon starting");

    // ── Collaborators ──────────────────────────────────────────

    let metrics = BuildMetrics::new();
    // No BuildKit client ships with this binary yet.
    warn!("no build engine client is linked into this daemon, builds and image inspections will fail with Unavailable");
    let connector: Arc<dyn EngineConnector> = Arc::new(UnlinkedEngine);
    let inspector: Arc<dyn ImageInspector> = Arc::new(UnlinkedEngine);

    let cluster: Option<Arc<dyn ClusterApi>> = if settings.needs_cluster() {
        let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::try_default().await?);
        info!("kubernetes client initialized");
        Some(cluster)
    } else {
        None
    };

    if settings.engine_address.is_none() && settings.discovery.is_none() {
        warn!("neither an engine address nor worker discovery is configured, builds will fail");
    }

    // ── Build service ──────────────────────────────────────────

    let mut dispatcher = BuildDispatcher::new(
        settings.dispatcher_config(),
        connector.clone(),
        inspector,
        metrics.clone(),
    );
    if let (Some(cluster), Some(opts)) = (&cluster, &settings.discovery) {
        let holder = holder_base()?;
        info!(
            %holder,
            namespace = %opts.namespace,
            selector = %opts.pod_selector,
            "worker discovery enabled"
        );
        let discoverer =
            WorkerDiscoverer::new(cluster.clone(), connector, metrics.clone(), holder);
        dispatcher = dispatcher.with_discoverer(Arc::new(discoverer));
    }
    let builds = BuildService::new(Arc::new(dispatcher));

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let downscale_handle = match (&cluster, &settings.downscale) {
        (Some(cluster), Some(down)) => {
            let downscaler = Downscaler::new(
                cluster.clone(),
                down.pod_selector.clone(),
                down.statefulset.clone(),
                down.grace_period,
            );
            let interval = down.interval;
            info!(
                statefulset = %down.statefulset,
                grace_period = ?down.grace_period,
                ?interval,
                "worker downscaler enabled"
            );
            let shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                downscaler.run(interval, shutdown).await;
            }))
        }
        _ => None,
    };

    // ── HTTP endpoint ──────────────────────────────────────────

    let router = build_router(AppState { builds, metrics });
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = downscale_handle {
        let _ = handle.await;
    }

    info!("kiln daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
