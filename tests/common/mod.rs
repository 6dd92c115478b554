// Shared test helpers: recording fakes for every engine collaborator

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wg_gateway::api::ControlPlane;
use wg_gateway::engine::{Engine, EngineDeps};
use wg_gateway::error::{ApiError, CommandError, DeviceError, FirewallError, SampleError};
use wg_gateway::load_sampler::LoadSource;
use wg_gateway::metrics::Metrics;
use wg_gateway::models::*;
use wg_gateway::portforward::FirewallReconciler;
use wg_gateway::wireguard::{DeviceReconciler, DeviceSync};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch,
    UpdatePeers(Vec<String>),
    AddPeer(String),
    RemovePeer(String),
    UpdatePortforwarding(Vec<String>),
    AddPortforwarding(String),
    RemovePortforwarding(String),
    Health(HealthSnapshot),
    Bandwidth(BandwidthUsageReport),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::UpdatePeers(_)
                | Call::AddPeer(_)
                | Call::RemovePeer(_)
                | Call::UpdatePortforwarding(_)
                | Call::AddPortforwarding(_)
                | Call::RemovePortforwarding(_)
        )
    }

    pub fn is_telemetry(&self) -> bool {
        matches!(self, Call::Health(_) | Call::Bandwidth(_))
    }
}

/// State shared by all fakes of one engine.
#[derive(Default)]
pub struct Shared {
    pub log: Mutex<Vec<Call>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub fail_fetch: AtomicBool,
    pub fail_device: AtomicBool,
    pub fail_firewall: AtomicBool,
    pub fail_telemetry: AtomicBool,
    pub fail_sampler: AtomicBool,
    pub peers: Mutex<Vec<Peer>>,
    pub connected_peers: AtomicUsize,
    /// Simulated duration of every device/firewall mutation.
    pub work: Mutex<Duration>,
}

impl Shared {
    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }

    async fn work(&self, call: Call) {
        let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(n, Ordering::SeqCst);
        let work = *self.work.lock().unwrap();
        if !work.is_zero() {
            tokio::time::sleep(work).await;
        }
        self.record(call);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn keys(peers: &[Peer]) -> Vec<String> {
    peers.iter().map(|p| p.pubkey.clone()).collect()
}

fn command_failure() -> CommandError {
    CommandError::Failed {
        command: "fake".into(),
        status: "exit status: 1".into(),
        stderr: "simulated".into(),
    }
}

fn http_failure(endpoint: &'static str) -> ApiError {
    ApiError::Status {
        endpoint,
        status: reqwest::StatusCode::BAD_GATEWAY,
    }
}

pub struct FakeApi(pub Arc<Shared>);

#[async_trait]
impl ControlPlane for FakeApi {
    async fn get_wireguard_peers(&self) -> Result<PeerList, ApiError> {
        self.0.record(Call::Fetch);
        if self.0.fail_fetch.load(Ordering::SeqCst) {
            return Err(http_failure("/wg/active-pubkeys/v2/"));
        }
        Ok(self.0.peers.lock().unwrap().clone())
    }

    async fn update_server_data(&self, snapshot: &HealthSnapshot) -> Result<(), ApiError> {
        self.0.record(Call::Health(snapshot.clone()));
        if self.0.fail_telemetry.load(Ordering::SeqCst) {
            return Err(http_failure("/update-server-data/"));
        }
        Ok(())
    }

    async fn update_peers_bandwidth_usages(
        &self,
        report: &BandwidthUsageReport,
    ) -> Result<(), ApiError> {
        self.0.record(Call::Bandwidth(report.clone()));
        if self.0.fail_telemetry.load(Ordering::SeqCst) {
            return Err(http_failure("/update-peers-bandwidth-usages/"));
        }
        Ok(())
    }
}

pub struct FakeDevice(pub Arc<Shared>);

#[async_trait]
impl DeviceReconciler for FakeDevice {
    async fn update_peers(&self, desired: &[Peer]) -> Result<DeviceSync, DeviceError> {
        if self.0.fail_device.load(Ordering::SeqCst) {
            return Err(command_failure().into());
        }
        self.0.work(Call::UpdatePeers(keys(desired))).await;
        let mut usage = BandwidthUsageReport::default();
        for p in desired {
            usage.push(
                &p.pubkey,
                UsageSample {
                    receive: 10,
                    transmit: 20,
                },
            );
        }
        Ok(DeviceSync {
            connected_peers: self.0.connected_peers.load(Ordering::SeqCst),
            usage,
        })
    }

    async fn add_peer(&self, peer: &Peer) -> Result<(), DeviceError> {
        if self.0.fail_device.load(Ordering::SeqCst) {
            return Err(command_failure().into());
        }
        self.0.work(Call::AddPeer(peer.pubkey.clone())).await;
        Ok(())
    }

    async fn remove_peer(&self, peer: &Peer) -> Result<(), DeviceError> {
        if self.0.fail_device.load(Ordering::SeqCst) {
            return Err(command_failure().into());
        }
        self.0.work(Call::RemovePeer(peer.pubkey.clone())).await;
        Ok(())
    }
}

pub struct FakeFirewall(pub Arc<Shared>);

#[async_trait]
impl FirewallReconciler for FakeFirewall {
    async fn update_portforwarding(&self, desired: &[Peer]) -> Result<(), FirewallError> {
        if self.0.fail_firewall.load(Ordering::SeqCst) {
            return Err(command_failure().into());
        }
        self.0.work(Call::UpdatePortforwarding(keys(desired))).await;
        Ok(())
    }

    async fn add_portforwarding(&self, peer: &Peer) -> Result<(), FirewallError> {
        if self.0.fail_firewall.load(Ordering::SeqCst) {
            return Err(command_failure().into());
        }
        self.0.work(Call::AddPortforwarding(peer.pubkey.clone())).await;
        Ok(())
    }

    async fn remove_portforwarding(&self, peer: &Peer) -> Result<(), FirewallError> {
        if self.0.fail_firewall.load(Ordering::SeqCst) {
            return Err(command_failure().into());
        }
        self.0
            .work(Call::RemovePortforwarding(peer.pubkey.clone()))
            .await;
        Ok(())
    }
}

pub struct FakeLoad(pub Arc<Shared>);

#[async_trait]
impl LoadSource for FakeLoad {
    async fn sample(&self) -> Result<LoadSample, SampleError> {
        if self.0.fail_sampler.load(Ordering::SeqCst) {
            return Err(SampleError::NoInterface);
        }
        Ok(LoadSample {
            cpu_usage: 12.0,
            rates: NetworkRates {
                receive: 1000,
                transmit: 2000,
            },
        })
    }
}

pub fn peer(pubkey: &str) -> Peer {
    Peer {
        ipv4: "10.0.0.2/32".into(),
        ipv6: "fc00::2/128".into(),
        ports: vec![5000],
        pubkey: pubkey.into(),
    }
}

pub fn event(action: EventAction, pubkey: &str) -> PeerEvent {
    PeerEvent {
        action,
        peer: peer(pubkey),
    }
}

/// Engine wired to recording fakes. Returns the engine and the shared fake state.
pub fn fake_engine(peers: Vec<Peer>, connected_peers: usize) -> (Engine, Arc<Shared>) {
    let shared = Arc::new(Shared::default());
    *shared.peers.lock().unwrap() = peers;
    shared.connected_peers.store(connected_peers, Ordering::SeqCst);
    let engine = Engine::new(EngineDeps {
        api: Box::new(FakeApi(shared.clone())),
        device: Box::new(FakeDevice(shared.clone())),
        firewall: Box::new(FakeFirewall(shared.clone())),
        load: Box::new(FakeLoad(shared.clone())),
        metrics: Arc::new(Metrics::new().unwrap()),
    });
    (engine, shared)
}
