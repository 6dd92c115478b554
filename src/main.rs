use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use wg_gateway::*;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    tracing::info!("starting {} {}", version::NAME, version::VERSION);

    let app_config = config::AppConfig::load()?;
    let metrics = Arc::new(metrics::Metrics::new().context("error registering metrics")?);
    let runner: Arc<dyn command::CommandRunner> = Arc::new(command::SystemCommand);

    let api = api::ApiClient::new(&app_config.api).context("error initializing api client")?;

    let interfaces: Vec<String> = app_config
        .wireguard
        .interfaces
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let wg = wireguard::WgCli::new(
        interfaces,
        Duration::from_secs(app_config.wireguard.handshake_timeout_secs),
        runner.clone(),
    )
    .await
    .context("error initializing wireguard")?;

    let pf = portforward::IpsetPortforward::new(&app_config.portforwarding, runner)
        .await
        .context("error initializing portforwarding")?;

    let load = load_sampler::LoadSampler::new(&app_config.load);

    let engine = engine::Engine::new(engine::EngineDeps {
        api: Box::new(api),
        device: Box::new(wg),
        firewall: Box::new(pf),
        load: Box::new(load),
        metrics: metrics.clone(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let metrics_handle = if app_config.metrics.enabled() {
        let addr = &app_config.metrics.listen;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("error binding metrics on {}", addr))?;
        tracing::info!("metrics listening on http://{}/metrics", addr);
        Some(metrics::serve(metrics.clone(), listener, shutdown_rx.clone()))
    } else {
        None
    };

    // Initial synchronization before accepting events
    engine.synchronize().await;

    let subscription = subscriber::Subscriber::new(&app_config.mq, metrics)
        .subscribe(shutdown_rx.clone())
        .await
        .context("error connecting to message-queue")?;

    let ticker = scheduler::JitterTicker::start(app_config.sync.interval(), app_config.sync.delay());

    let engine_handle = engine::spawn(
        engine,
        engine::DispatchInputs {
            ticker,
            events: subscription.events,
            shutdown_rx,
            stats_log_interval: Duration::from_secs(app_config.sync.stats_log_interval_secs),
        },
    );

    wait_for_signal().await;
    tracing::info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);
    let _ = engine_handle.await;
    let _ = subscription.handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    tracing::info!("shut down");

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
