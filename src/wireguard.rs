// WireGuard device reconciler driven by the `wg` tool.

use crate::command::{CommandRunner, args};
use crate::error::DeviceError;
use crate::models::{BandwidthUsageReport, Peer, UsageSample};
use async_trait::async_trait;
use base64::Engine as _;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Result of a full device reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSync {
    pub connected_peers: usize,
    pub usage: BandwidthUsageReport,
}

/// Applies peer changes to the local WireGuard interfaces.
#[async_trait]
pub trait DeviceReconciler: Send + Sync {
    /// Make the device peer set match `desired`.
    async fn update_peers(&self, desired: &[Peer]) -> Result<DeviceSync, DeviceError>;

    async fn add_peer(&self, peer: &Peer) -> Result<(), DeviceError>;

    async fn remove_peer(&self, peer: &Peer) -> Result<(), DeviceError>;
}

/// One peer line from `wg show <iface> dump`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
    pub pubkey: String,
    pub allowed_ips: BTreeSet<String>,
    /// Unix seconds, 0 if never.
    pub latest_handshake: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Parses `wg show <iface> dump`. The first line describes the interface itself.
pub fn parse_dump(interface: &str, output: &str) -> Result<Vec<DevicePeer>, DeviceError> {
    let parse_err = |line: &str| DeviceError::Parse {
        interface: interface.to_string(),
        line: line.to_string(),
    };
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() < 8 {
                return Err(parse_err(line));
            }
            let allowed_ips = match fields[3] {
                "(none)" | "" => BTreeSet::new(),
                ips => ips.split(',').map(|s| s.trim().to_string()).collect(),
            };
            let num = |s: &str| s.parse::<u64>().map_err(|_| parse_err(line));
            Ok(DevicePeer {
                pubkey: fields[0].to_string(),
                allowed_ips,
                latest_handshake: num(fields[4])?,
                rx_bytes: num(fields[5])?,
                tx_bytes: num(fields[6])?,
            })
        })
        .collect()
}

/// Changes needed to turn `actual` into `desired` on one interface.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PeerPlan<'a> {
    pub add: Vec<&'a Peer>,
    pub remove: Vec<String>,
}

pub fn plan_peer_changes<'a>(actual: &[DevicePeer], desired: &'a [Peer]) -> PeerPlan<'a> {
    let wanted: HashMap<&str, &Peer> = desired.iter().map(|p| (p.pubkey.as_str(), p)).collect();
    let current: HashMap<&str, &DevicePeer> =
        actual.iter().map(|p| (p.pubkey.as_str(), p)).collect();

    let remove = actual
        .iter()
        .filter(|p| !wanted.contains_key(p.pubkey.as_str()))
        .map(|p| p.pubkey.clone())
        .collect();
    let add = desired
        .iter()
        .filter(|p| match current.get(p.pubkey.as_str()) {
            Some(existing) => {
                existing.allowed_ips != p.allowed_ips().into_iter().collect::<BTreeSet<String>>()
            }
            None => true,
        })
        .collect();
    PeerPlan { add, remove }
}

/// True for a base64-encoded 32-byte key.
pub fn is_valid_pubkey(key: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}

/// Usage sample from cumulative device counters, saturating at `i64::MAX`.
pub fn usage_sample(peer: &DevicePeer) -> UsageSample {
    UsageSample {
        receive: i64::try_from(peer.rx_bytes).unwrap_or(i64::MAX),
        transmit: i64::try_from(peer.tx_bytes).unwrap_or(i64::MAX),
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct WgCli {
    interfaces: Vec<String>,
    handshake_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl WgCli {
    /// Verifies every interface is a WireGuard device. Any failure is fatal for the node.
    pub async fn new(
        interfaces: Vec<String>,
        handshake_timeout: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, DeviceError> {
        for iface in &interfaces {
            let key = runner
                .run("wg", &args(["show", iface, "public-key"]))
                .await?;
            info!(interface = %iface, public_key = %key.trim(), "wireguard interface ready");
        }
        Ok(Self {
            interfaces,
            handshake_timeout,
            runner,
        })
    }

    async fn dump(&self, iface: &str) -> Result<Vec<DevicePeer>, DeviceError> {
        let out = self.runner.run("wg", &args(["show", iface, "dump"])).await?;
        parse_dump(iface, &out)
    }

    async fn set_peer(&self, iface: &str, peer: &Peer) -> Result<(), DeviceError> {
        let mut cmd = args(["set", iface, "peer", &peer.pubkey]);
        let ips = peer.allowed_ips();
        if !ips.is_empty() {
            cmd.push("allowed-ips".into());
            cmd.push(ips.join(","));
        }
        self.runner.run("wg", &cmd).await?;
        Ok(())
    }

    async fn unset_peer(&self, iface: &str, pubkey: &str) -> Result<(), DeviceError> {
        self.runner
            .run("wg", &args(["set", iface, "peer", pubkey, "remove"]))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceReconciler for WgCli {
    #[instrument(skip(self, desired), fields(operation = "update_peers", desired = desired.len()))]
    async fn update_peers(&self, desired: &[Peer]) -> Result<DeviceSync, DeviceError> {
        let valid: Vec<Peer> = desired
            .iter()
            .filter(|p| {
                let ok = is_valid_pubkey(&p.pubkey);
                if !ok {
                    warn!(pubkey = %p.pubkey, "skipping peer with invalid public key");
                }
                ok
            })
            .cloned()
            .collect();
        let desired_keys: HashSet<&str> = valid.iter().map(|p| p.pubkey.as_str()).collect();
        let cutoff = unix_now().saturating_sub(self.handshake_timeout.as_secs());

        let mut connected: HashSet<String> = HashSet::new();
        let mut usage = BandwidthUsageReport::default();

        for iface in &self.interfaces {
            let actual = self.dump(iface).await?;
            for p in actual.iter().filter(|p| desired_keys.contains(p.pubkey.as_str())) {
                if p.latest_handshake > 0 && p.latest_handshake >= cutoff {
                    connected.insert(p.pubkey.clone());
                }
                usage.push(&p.pubkey, usage_sample(p));
            }

            let plan = plan_peer_changes(&actual, &valid);
            for pubkey in &plan.remove {
                self.unset_peer(iface, pubkey).await?;
            }
            for peer in &plan.add {
                self.set_peer(iface, peer).await?;
            }
            debug!(
                interface = %iface,
                added = plan.add.len(),
                removed = plan.remove.len(),
                "peers reconciled"
            );
        }

        Ok(DeviceSync {
            connected_peers: connected.len(),
            usage,
        })
    }

    #[instrument(skip(self, peer), fields(operation = "add_peer", pubkey = %peer.pubkey))]
    async fn add_peer(&self, peer: &Peer) -> Result<(), DeviceError> {
        if !is_valid_pubkey(&peer.pubkey) {
            warn!("ignoring add for invalid public key");
            return Ok(());
        }
        for iface in &self.interfaces {
            self.set_peer(iface, peer).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, peer), fields(operation = "remove_peer", pubkey = %peer.pubkey))]
    async fn remove_peer(&self, peer: &Peer) -> Result<(), DeviceError> {
        if !is_valid_pubkey(&peer.pubkey) {
            warn!("ignoring remove for invalid public key");
            return Ok(());
        }
        for iface in &self.interfaces {
            self.unset_peer(iface, &peer.pubkey).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use std::sync::Mutex;

    fn key(c: char) -> String {
        format!("{}A=", c.to_string().repeat(42))
    }

    fn peer(c: char, ipv4: &str) -> Peer {
        Peer {
            ipv4: ipv4.into(),
            ipv6: String::new(),
            ports: vec![],
            pubkey: key(c),
        }
    }

    /// Answers `wg show <iface> dump` from a fixed table and records every call.
    #[derive(Default)]
    struct FakeWg {
        dumps: HashMap<String, String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for FakeWg {
        async fn run(&self, program: &str, args: &[String]) -> Result<String, CommandError> {
            self.calls
                .lock()
                .unwrap()
                .push(crate::command::display(program, args));
            if args.get(2).map(String::as_str) == Some("dump") {
                return Ok(self.dumps.get(&args[1]).cloned().unwrap_or_default());
            }
            Ok(String::new())
        }
    }

    fn dump_line(pubkey: &str, ips: &str, handshake: u64, rx: u64, tx: u64) -> String {
        format!("{pubkey}\t(none)\t1.2.3.4:51820\t{ips}\t{handshake}\t{rx}\t{tx}\toff")
    }

    const HEADER: &str = "privkey\tpubkey\t51820\toff";

    #[test]
    fn parse_dump_skips_interface_line() {
        let out = format!(
            "{HEADER}\n{}\n{}\n",
            dump_line(&key('B'), "10.0.0.2/32,fc00::2/128", 1700000000, 10, 20),
            dump_line(&key('C'), "(none)", 0, 0, 0)
        );
        let peers = parse_dump("wg0", &out).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].allowed_ips.len(), 2);
        assert_eq!(peers[0].rx_bytes, 10);
        assert!(peers[1].allowed_ips.is_empty());
    }

    #[test]
    fn parse_dump_rejects_short_line() {
        let out = format!("{HEADER}\nbroken\tline\n");
        assert!(matches!(
            parse_dump("wg0", &out),
            Err(DeviceError::Parse { .. })
        ));
    }

    #[test]
    fn plan_adds_missing_removes_stale_and_updates_changed() {
        let actual = parse_dump(
            "wg0",
            &format!(
                "{HEADER}\n{}\n{}\n{}\n",
                dump_line(&key('B'), "10.0.0.2/32", 0, 0, 0),
                dump_line(&key('C'), "10.0.0.3/32", 0, 0, 0),
                dump_line(&key('D'), "10.0.0.4/32", 0, 0, 0),
            ),
        )
        .unwrap();
        let desired = vec![
            peer('B', "10.0.0.2"),
            peer('C', "10.0.0.30"),
            peer('E', "10.0.0.5"),
        ];
        let plan = plan_peer_changes(&actual, &desired);
        let added: Vec<&str> = plan.add.iter().map(|p| p.pubkey.as_str()).collect();
        assert_eq!(added, vec![key('C').as_str(), key('E').as_str()]);
        assert_eq!(plan.remove, vec![key('D')]);
    }

    #[test]
    fn usage_sample_saturates_instead_of_wrapping() {
        let out = format!(
            "{HEADER}\n{}\n",
            dump_line(&key('B'), "10.0.0.2/32", 0, u64::MAX, 1 << 63)
        );
        let peers = parse_dump("wg0", &out).unwrap();
        assert_eq!(
            usage_sample(&peers[0]),
            UsageSample { receive: i64::MAX, transmit: i64::MAX }
        );
        let small = DevicePeer { rx_bytes: 42, tx_bytes: 7, ..peers[0].clone() };
        assert_eq!(usage_sample(&small), UsageSample { receive: 42, transmit: 7 });
    }

    #[test]
    fn pubkey_validation() {
        assert!(is_valid_pubkey(&key('B')));
        assert!(!is_valid_pubkey("A"));
        assert!(!is_valid_pubkey("not base64 at all!"));
    }

    #[tokio::test]
    async fn update_peers_counts_recent_handshakes_and_reports_usage() {
        let now = unix_now();
        let mut fake = FakeWg::default();
        fake.dumps.insert(
            "wg0".into(),
            format!(
                "{HEADER}\n{}\n{}\n{}\n",
                dump_line(&key('B'), "10.0.0.2/32", now - 10, 100, 200),
                dump_line(&key('C'), "10.0.0.3/32", now - 3600, 5, 6),
                dump_line(&key('D'), "10.0.0.4/32", now, 1, 1),
            ),
        );
        fake.dumps.insert(
            "wg1".into(),
            format!("{HEADER}\n{}\n", dump_line(&key('B'), "10.0.0.2/32", 0, 7, 8)),
        );
        let fake = Arc::new(fake);
        let wg = WgCli::new(
            vec!["wg0".into(), "wg1".into()],
            Duration::from_secs(180),
            fake.clone(),
        )
        .await
        .unwrap();

        let desired = vec![peer('B', "10.0.0.2"), peer('C', "10.0.0.3")];
        let sync = wg.update_peers(&desired).await.unwrap();

        assert_eq!(sync.connected_peers, 1);
        assert_eq!(
            sync.usage.peers[&key('B')],
            vec![
                UsageSample { receive: 100, transmit: 200 },
                UsageSample { receive: 7, transmit: 8 },
            ]
        );
        assert!(!sync.usage.peers.contains_key(&key('D')));

        let calls = fake.calls.lock().unwrap();
        assert!(calls.contains(&format!("wg set wg0 peer {} remove", key('D'))));
        assert!(calls.contains(&format!("wg set wg1 peer {} allowed-ips 10.0.0.3/32", key('C'))));
        assert!(!calls.iter().any(|c| c.starts_with(&format!("wg set wg0 peer {} allowed-ips", key('B')))));
    }

    #[tokio::test]
    async fn add_and_remove_apply_to_every_interface() {
        let fake = Arc::new(FakeWg::default());
        let wg = WgCli::new(
            vec!["wg0".into(), "wg1".into()],
            Duration::from_secs(180),
            fake.clone(),
        )
        .await
        .unwrap();
        let p = peer('B', "10.0.0.2");
        wg.add_peer(&p).await.unwrap();
        wg.remove_peer(&p).await.unwrap();
        let calls = fake.calls.lock().unwrap();
        let sets: Vec<&String> = calls.iter().filter(|c| c.starts_with("wg set")).collect();
        assert_eq!(sets.len(), 4);
    }
}
