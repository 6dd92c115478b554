// Peer models shared by the control plane, the message queue and the reconcilers

use serde::{Deserialize, Deserializer, Serialize};

/// A WireGuard peer as the control plane describes it. Identity is `pubkey`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(default, deserialize_with = "null_as_default")]
    pub ipv4: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ipv6: String,
    /// Forwarded ports. Null means none; values outside 0..=65535 are dropped on decode.
    #[serde(default, deserialize_with = "valid_ports")]
    pub ports: Vec<u16>,
    pub pubkey: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn valid_ports<'de, D>(deserializer: D) -> Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<i64> = null_as_default(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|port| match u16::try_from(port) {
            Ok(port) => Some(port),
            Err(_) => {
                tracing::warn!(port, "dropping out-of-range port");
                None
            }
        })
        .collect())
}

impl Peer {
    /// Allowed IPs in CIDR form. Bare addresses get a host prefix (/32 or /128).
    pub fn allowed_ips(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if let Some(v4) = with_prefix(&self.ipv4, 32) {
            out.push(v4);
        }
        if let Some(v6) = with_prefix(&self.ipv6, 128) {
            out.push(v6);
        }
        out
    }

    /// Addresses with any prefix length stripped, skipping empty ones.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        [self.ipv4.as_str(), self.ipv6.as_str()]
            .into_iter()
            .map(strip_prefix)
            .filter(|a| !a.is_empty())
    }
}

fn with_prefix(addr: &str, bits: u8) -> Option<String> {
    let addr = addr.trim();
    if addr.is_empty() {
        None
    } else if addr.contains('/') {
        Some(addr.to_string())
    } else {
        Some(format!("{}/{}", addr, bits))
    }
}

fn strip_prefix(addr: &str) -> &str {
    let addr = addr.trim();
    addr.split_once('/').map_or(addr, |(ip, _)| ip)
}

/// Full desired peer set returned by the control plane.
pub type PeerList = Vec<Peer>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    #[serde(rename = "ADD")]
    Add,
    #[serde(rename = "REMOVE")]
    Remove,
    /// Any other action string. Discarded by the dispatch loop.
    #[serde(other)]
    Unknown,
}

/// Add/remove notification pushed through the message queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub action: EventAction,
    pub peer: Peer,
}
