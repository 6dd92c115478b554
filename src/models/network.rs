// Raw interface counters used by the load sampler

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub name: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Cumulative counters for every interface at one point in time, keyed by device name.
pub type CounterSnapshot = HashMap<String, InterfaceCounters>;

/// Receive/transmit throughput in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkRates {
    pub receive: u64,
    pub transmit: u64,
}

/// Host load for one health report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub cpu_usage: f32,
    pub rates: NetworkRates,
}
