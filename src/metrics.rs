// Prometheus metrics for reconciliation, exported over HTTP at /metrics and summarised
// periodically in the log by the dispatch loop

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::watch;

const NAMESPACE: &str = "wireguard";

/// Buckets in seconds for per-stage timings.
const STAGE_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

pub struct Metrics {
    registry: Registry,

    pub synchronize_total: IntCounter,
    pub error_getting_peers: IntCounter,
    pub device_errors: IntCounter,
    pub firewall_errors: IntCounter,
    pub telemetry_errors: IntCounter,
    pub sampler_errors: IntCounter,
    pub events_applied: IntCounter,
    pub events_ignored: IntCounter,
    pub subscriber_reconnects: IntCounter,

    pub get_wireguard_peers_time: Histogram,
    pub update_peers_time: Histogram,
    pub update_portforwarding_time: Histogram,
    pub synchronize_time: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some(NAMESPACE.into()), None)?;

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let timing = |name: &str, help: &str| -> Result<Histogram, prometheus::Error> {
            let h = Histogram::with_opts(
                HistogramOpts::new(name, help).buckets(STAGE_BUCKETS.to_vec()),
            )?;
            registry.register(Box::new(h.clone()))?;
            Ok(h)
        };

        Ok(Self {
            synchronize_total: counter("synchronize_total", "Full reconciliations started")?,
            error_getting_peers: counter(
                "error_getting_peers_total",
                "Failed fetches of the desired peer set",
            )?,
            device_errors: counter("device_errors_total", "Failed WireGuard device updates")?,
            firewall_errors: counter(
                "firewall_errors_total",
                "Failed port-forwarding updates",
            )?,
            telemetry_errors: counter(
                "telemetry_errors_total",
                "Failed health or bandwidth reports",
            )?,
            sampler_errors: counter("sampler_errors_total", "Failed load samples")?,
            events_applied: counter(
                "events_applied_total",
                "Peer events applied to the device or firewall",
            )?,
            events_ignored: counter(
                "events_ignored_total",
                "Peer events discarded for an unknown action",
            )?,
            subscriber_reconnects: counter(
                "subscriber_reconnects_total",
                "Message-queue reconnect attempts",
            )?,
            get_wireguard_peers_time: timing(
                "get_wireguard_peers_seconds",
                "Time to fetch the desired peer set",
            )?,
            update_peers_time: timing("update_peers_seconds", "Time to reconcile device peers")?,
            update_portforwarding_time: timing(
                "update_portforwarding_seconds",
                "Time to reconcile port forwarding",
            )?,
            synchronize_time: timing(
                "synchronize_seconds",
                "Time for one full reconciliation",
            )?,
            registry,
        })
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    pub fn log_stats(&self) {
        tracing::info!(
            synchronize_total = self.synchronize_total.get(),
            error_getting_peers = self.error_getting_peers.get(),
            device_errors = self.device_errors.get(),
            firewall_errors = self.firewall_errors.get(),
            telemetry_errors = self.telemetry_errors.get(),
            sampler_errors = self.sampler_errors.get(),
            events_applied = self.events_applied.get(),
            events_ignored = self.events_ignored.get(),
            subscriber_reconnects = self.subscriber_reconnects.get(),
            "app stats"
        );
    }
}

async fn prometheus_metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                e.to_string(),
            )
        }
    }
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .with_state(metrics)
}

/// Serves /metrics on `listener` until shutdown.
pub fn serve(
    metrics: Arc<Metrics>,
    listener: tokio::net::TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let app = router(metrics);
    tokio::spawn(async move {
        let shutdown = async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::warn!(error = %e, "metrics server stopped");
        }
    })
}
