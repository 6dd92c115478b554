// Outbound telemetry: node health and per-peer bandwidth usage

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One node-health report, built fresh each full reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub connected_peers: usize,
    /// Host CPU usage in percent (0..=100).
    pub cpu_usage: f32,
    /// Bytes per second.
    pub receive_rate: u64,
    pub transmit_rate: u64,
}

impl HealthSnapshot {
    /// Wire body for `update-server-data`. Every field is string-encoded.
    pub fn to_wire(&self) -> ServerDataBody {
        ServerDataBody {
            connected_peers: self.connected_peers.to_string(),
            cpu_usage: format!("{:.0}", self.cpu_usage.clamp(0.0, 100.0)),
            receive: self.receive_rate.to_string(),
            transfer: self.transmit_rate.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerDataBody {
    pub connected_peers: String,
    pub cpu_usage: String,
    pub receive: String,
    pub transfer: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSample {
    pub receive: i64,
    pub transmit: i64,
}

/// Batched per-peer usage keyed by pubkey.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BandwidthUsageReport {
    pub peers: BTreeMap<String, Vec<UsageSample>>,
}

impl BandwidthUsageReport {
    pub fn push(&mut self, pubkey: &str, sample: UsageSample) {
        self.peers.entry(pubkey.to_string()).or_default().push(sample);
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_wire_body_is_string_encoded() {
        let snap = HealthSnapshot {
            connected_peers: 2,
            cpu_usage: 37.6,
            receive_rate: 1000,
            transmit_rate: 250,
        };
        let json = serde_json::to_value(snap.to_wire()).unwrap();
        assert_eq!(json["connected_peers"], "2");
        assert_eq!(json["cpu_usage"], "38");
        assert_eq!(json["receive"], "1000");
        assert_eq!(json["transfer"], "250");
    }

    #[test]
    fn usage_report_groups_samples_by_pubkey() {
        let mut report = BandwidthUsageReport::default();
        report.push("a", UsageSample { receive: 1, transmit: 2 });
        report.push("a", UsageSample { receive: 3, transmit: 4 });
        report.push("b", UsageSample { receive: 5, transmit: 6 });
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(
            json,
            r#"{"peers":{"a":[{"receive":1,"transmit":2},{"receive":3,"transmit":4}],"b":[{"receive":5,"transmit":6}]}}"#
        );
    }
}
