// Domain models

mod network;
mod peer;
mod telemetry;

pub use network::{CounterSnapshot, InterfaceCounters, LoadSample, NetworkRates};
pub use peer::{EventAction, Peer, PeerEvent, PeerList};
pub use telemetry::{BandwidthUsageReport, HealthSnapshot, ServerDataBody, UsageSample};
