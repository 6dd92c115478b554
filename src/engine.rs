// Reconciliation engine: one dispatch loop consumes jittered ticks and peer events and
// runs exactly one reconciliation per input. Inputs are never processed concurrently, so
// the device and firewall reconcilers need no locking of their own.

use crate::api::ControlPlane;
use crate::load_sampler::LoadSource;
use crate::metrics::Metrics;
use crate::models::{EventAction, HealthSnapshot, PeerEvent};
use crate::portforward::FirewallReconciler;
use crate::scheduler::JitterTicker;
use crate::wireguard::DeviceReconciler;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant, interval_at};
use tracing::{debug, info, warn};

/// Collaborators owned by the engine for its whole lifetime.
pub struct EngineDeps {
    pub api: Box<dyn ControlPlane>,
    pub device: Box<dyn DeviceReconciler>,
    pub firewall: Box<dyn FirewallReconciler>,
    pub load: Box<dyn LoadSource>,
    pub metrics: Arc<Metrics>,
}

/// Inputs of the dispatch loop.
pub struct DispatchInputs {
    pub ticker: JitterTicker,
    pub events: mpsc::Receiver<PeerEvent>,
    pub shutdown_rx: watch::Receiver<bool>,
    /// How often to log reconciliation counters.
    pub stats_log_interval: Duration,
}

/// What a full reconciliation managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Peer fetch failed; nothing was touched.
    FetchFailed,
    Synchronized {
        peers: usize,
        health_reported: bool,
    },
}

pub struct Engine {
    api: Box<dyn ControlPlane>,
    device: Box<dyn DeviceReconciler>,
    firewall: Box<dyn FirewallReconciler>,
    load: Box<dyn LoadSource>,
    metrics: Arc<Metrics>,
}

impl Engine {
    pub fn new(deps: EngineDeps) -> Self {
        let EngineDeps {
            api,
            device,
            firewall,
            load,
            metrics,
        } = deps;
        Self {
            api,
            device,
            firewall,
            load,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Full reconciliation against a freshly fetched desired peer set.
    pub async fn synchronize(&self) -> SyncOutcome {
        let started = Instant::now();
        self.metrics.synchronize_total.inc();

        let peers = match self.api.get_wireguard_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                self.metrics.error_getting_peers.inc();
                self.metrics
                    .synchronize_time
                    .observe(started.elapsed().as_secs_f64());
                warn!(
                    error = %e,
                    operation = "get_wireguard_peers",
                    "error getting peers"
                );
                return SyncOutcome::FetchFailed;
            }
        };
        self.metrics
            .get_wireguard_peers_time
            .observe(started.elapsed().as_secs_f64());
        debug!(peers = peers.len(), "fetched desired peer set");

        let t = Instant::now();
        let connected_peers = match self.device.update_peers(&peers).await {
            Ok(sync) => {
                if !sync.usage.is_empty()
                    && let Err(e) = self.api.update_peers_bandwidth_usages(&sync.usage).await
                {
                    self.metrics.telemetry_errors.inc();
                    warn!(
                        error = %e,
                        operation = "update_peers_bandwidth_usages",
                        "bandwidth report failed"
                    );
                }
                Some(sync.connected_peers)
            }
            Err(e) => {
                self.metrics.device_errors.inc();
                warn!(error = %e, operation = "update_peers", "error updating peers");
                None
            }
        };
        self.metrics
            .update_peers_time
            .observe(t.elapsed().as_secs_f64());

        let t = Instant::now();
        if let Err(e) = self.firewall.update_portforwarding(&peers).await {
            self.metrics.firewall_errors.inc();
            warn!(
                error = %e,
                operation = "update_portforwarding",
                "error updating portforwarding"
            );
        }
        self.metrics
            .update_portforwarding_time
            .observe(t.elapsed().as_secs_f64());

        let health_reported = match connected_peers {
            Some(connected_peers) => self.report_health(connected_peers).await,
            None => false,
        };

        let elapsed = started.elapsed();
        self.metrics.synchronize_time.observe(elapsed.as_secs_f64());
        debug!(
            peers = peers.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "synchronized"
        );
        SyncOutcome::Synchronized {
            peers: peers.len(),
            health_reported,
        }
    }

    /// Samples load and pushes one health snapshot. Returns true if the push succeeded.
    async fn report_health(&self, connected_peers: usize) -> bool {
        let load = match self.load.sample().await {
            Ok(load) => load,
            Err(e) => {
                self.metrics.sampler_errors.inc();
                warn!(error = %e, operation = "sample_load", "skipping health report");
                return false;
            }
        };
        let snapshot = HealthSnapshot {
            connected_peers,
            cpu_usage: load.cpu_usage,
            receive_rate: load.rates.receive,
            transmit_rate: load.rates.transmit,
        };
        match self.api.update_server_data(&snapshot).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.telemetry_errors.inc();
                warn!(
                    error = %e,
                    operation = "update_server_data",
                    "health report failed"
                );
                false
            }
        }
    }

    /// Incremental reconciliation for one event. Unknown actions are discarded.
    /// Counts as applied when the device or the firewall accepted the change.
    pub async fn handle_event(&self, event: PeerEvent) {
        let PeerEvent { action, peer } = event;
        let (device_ok, firewall_ok) = match action {
            EventAction::Add => {
                let device_ok = match self.device.add_peer(&peer).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.metrics.device_errors.inc();
                        warn!(error = %e, pubkey = %peer.pubkey, operation = "add_peer", "error adding peer");
                        false
                    }
                };
                let firewall_ok = match self.firewall.add_portforwarding(&peer).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.metrics.firewall_errors.inc();
                        warn!(error = %e, pubkey = %peer.pubkey, operation = "add_portforwarding", "error adding portforwarding");
                        false
                    }
                };
                (device_ok, firewall_ok)
            }
            EventAction::Remove => {
                let device_ok = match self.device.remove_peer(&peer).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.metrics.device_errors.inc();
                        warn!(error = %e, pubkey = %peer.pubkey, operation = "remove_peer", "error removing peer");
                        false
                    }
                };
                let firewall_ok = match self.firewall.remove_portforwarding(&peer).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.metrics.firewall_errors.inc();
                        warn!(error = %e, pubkey = %peer.pubkey, operation = "remove_portforwarding", "error removing portforwarding");
                        false
                    }
                };
                (device_ok, firewall_ok)
            }
            EventAction::Unknown => {
                self.metrics.events_ignored.inc();
                debug!(pubkey = %peer.pubkey, "ignoring event with unknown action");
                return;
            }
        };
        if device_ok || firewall_ok {
            self.metrics.events_applied.inc();
            debug!(?action, pubkey = %peer.pubkey, device_ok, firewall_ok, "event applied");
        } else {
            warn!(?action, pubkey = %peer.pubkey, "event not applied");
        }
    }

    /// Dispatch loop. Returns after shutdown; an action already started always completes.
    pub async fn run(self, inputs: DispatchInputs) {
        let DispatchInputs {
            mut ticker,
            mut events,
            mut shutdown_rx,
            stats_log_interval,
        } = inputs;

        let mut stats_log_tick = interval_at(Instant::now() + stats_log_interval, stats_log_interval);
        stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events_open = true;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                tick = ticker.tick() => {
                    if tick.is_none() || *shutdown_rx.borrow() {
                        break;
                    }
                    self.synchronize().await;
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        self.handle_event(event).await;
                    }
                    None => {
                        warn!("event subscription closed; continuing with polling only");
                        events_open = false;
                    }
                },
                _ = stats_log_tick.tick() => self.metrics.log_stats(),
            }
        }

        ticker.stop();
        info!("dispatch loop stopped");
    }
}

/// Spawns the dispatch loop on its own task.
pub fn spawn(engine: Engine, inputs: DispatchInputs) -> tokio::task::JoinHandle<()> {
    tokio::spawn(engine.run(inputs))
}
