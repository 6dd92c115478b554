// Host load: CPU usage plus receive/transmit throughput of the physical NIC.
// Throughput is the delta of two cumulative counter snapshots taken T apart.

mod linux;

use crate::config::LoadConfig;
use crate::error::SampleError;
use crate::models::{CounterSnapshot, InterfaceCounters, LoadSample, NetworkRates};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Networks, System};
use tracing::instrument;

/// Lower bound on the sampling interval.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Source of host load for health reports.
#[async_trait]
pub trait LoadSource: Send + Sync {
    async fn sample(&self) -> Result<LoadSample, SampleError>;
}

/// Produces cumulative per-interface byte counters.
pub trait CounterSource: Send {
    fn snapshot(&mut self) -> CounterSnapshot;
}

/// Counters from `sysinfo::Networks` totals.
pub struct SysinfoCounters {
    networks: Networks,
}

impl Default for SysinfoCounters {
    fn default() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl CounterSource for SysinfoCounters {
    fn snapshot(&mut self) -> CounterSnapshot {
        self.networks.refresh(true);
        self.networks
            .list()
            .iter()
            .map(|(name, data)| {
                (
                    name.clone(),
                    InterfaceCounters {
                        name: name.clone(),
                        rx_bytes: data.total_received(),
                        tx_bytes: data.total_transmitted(),
                    },
                )
            })
            .collect()
    }
}

/// Rate for `interface` between two snapshots taken `interval` apart.
/// Returns `None` when the interface is missing from either snapshot.
pub fn compute_rates(
    before: &CounterSnapshot,
    after: &CounterSnapshot,
    interface: &str,
    interval: Duration,
) -> Option<NetworkRates> {
    let t0 = before.get(interface)?;
    let t1 = after.get(interface)?;
    let secs = interval.max(MIN_SAMPLE_INTERVAL).as_secs_f64();
    let per_sec = |delta: u64| (delta as f64 / secs) as u64;
    Some(NetworkRates {
        receive: per_sec(t1.rx_bytes.saturating_sub(t0.rx_bytes)),
        transmit: per_sec(t1.tx_bytes.saturating_sub(t0.tx_bytes)),
    })
}

/// Takes snapshots `interval` apart until two consecutive ones both contain `interface`.
/// The first pair is always taken; another is only started if it fits before `timeout`,
/// otherwise [`SampleError::Timeout`].
pub fn sample_rates<S: CounterSource + ?Sized>(
    source: &mut S,
    interface: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<NetworkRates, SampleError> {
    let interval = interval.max(MIN_SAMPLE_INTERVAL);
    let mut previous = source.snapshot();
    let deadline = Instant::now() + timeout;
    loop {
        std::thread::sleep(interval);
        let current = source.snapshot();
        if let Some(rates) = compute_rates(&previous, &current, interface, interval) {
            return Ok(rates);
        }
        if Instant::now() + interval > deadline {
            return Err(SampleError::Timeout {
                interface: interface.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        tracing::debug!(interface, "interface missing from counter snapshot; resampling");
        previous = current;
    }
}

struct SamplerState {
    sys: System,
    counters: Box<dyn CounterSource>,
}

pub struct LoadSampler {
    state: Arc<Mutex<SamplerState>>,
    interface: Option<String>,
    interval: Duration,
    timeout: Duration,
}

impl LoadSampler {
    pub fn new(config: &LoadConfig) -> Self {
        Self::with_counters(config, Box::new(SysinfoCounters::default()))
    }

    pub fn with_counters(config: &LoadConfig, counters: Box<dyn CounterSource>) -> Self {
        let interface = config
            .interface
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(linux::resolve_physical_interface);
        match &interface {
            Some(name) => tracing::info!(interface = %name, "monitoring network interface"),
            None => tracing::warn!("no physical network interface found; health reports disabled"),
        }
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self {
            state: Arc::new(Mutex::new(SamplerState { sys, counters })),
            interface,
            interval: Duration::from_millis(config.sample_interval_ms).max(MIN_SAMPLE_INTERVAL),
            timeout: Duration::from_millis(config.sample_timeout_ms),
        }
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }
}

#[async_trait]
impl LoadSource for LoadSampler {
    #[instrument(skip(self), fields(operation = "sample_load"))]
    async fn sample(&self) -> Result<LoadSample, SampleError> {
        let interface = self.interface.clone().ok_or(SampleError::NoInterface)?;
        let state = self.state.clone();
        let (interval, timeout) = (self.interval, self.timeout);
        tokio::task::spawn_blocking(move || {
            let mut guard = match state.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let SamplerState { sys, counters } = &mut *guard;
            let started = Instant::now();
            sys.refresh_cpu_usage();
            let rates = sample_rates(counters.as_mut(), &interface, interval, timeout)?;
            if let Some(rest) = sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
            sys.refresh_cpu_usage();
            Ok::<_, SampleError>(LoadSample {
                cpu_usage: sys.global_cpu_usage().clamp(0.0, 100.0),
                rates,
            })
        })
        .await?
    }
}
