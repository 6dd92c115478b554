// Prometheus endpoint tests

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wg_gateway::metrics::{Metrics, serve};

#[tokio::test]
async fn metrics_endpoint_exposes_counters_and_stops_on_shutdown() {
    let metrics = Arc::new(Metrics::new().unwrap());
    metrics.synchronize_total.inc();
    metrics.telemetry_errors.inc();
    metrics.update_peers_time.observe(0.3);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = serve(metrics.clone(), listener, shutdown_rx);

    let response = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap();
    assert!(response.status().is_success());
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = response.text().await.unwrap();
    assert!(body.contains("wireguard_synchronize_total 1"));
    assert!(body.contains("wireguard_telemetry_errors_total 1"));
    assert!(body.contains("wireguard_update_peers_seconds_count 1"));
    assert!(body.contains("wireguard_events_applied_total 0"));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let metrics = Arc::new(Metrics::new().unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handle = serve(metrics, listener, shutdown_rx);

    let response = reqwest::get(format!("http://{}/other", addr)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
