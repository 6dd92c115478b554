// Port-forwarding reconciler: one hash:ip,port ipset per address family, matched by an
// ACCEPT rule in the configured iptables/ip6tables chain.

use crate::command::{CommandRunner, args};
use crate::config::PortforwardingConfig;
use crate::error::FirewallError;
use crate::models::Peer;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const PROTOCOLS: [&str; 2] = ["tcp", "udp"];

/// Applies port-forwarding rules derived from the peer set.
#[async_trait]
pub trait FirewallReconciler: Send + Sync {
    /// Make the forwarding rules match `desired`.
    async fn update_portforwarding(&self, desired: &[Peer]) -> Result<(), FirewallError>;

    async fn add_portforwarding(&self, peer: &Peer) -> Result<(), FirewallError>;

    async fn remove_portforwarding(&self, peer: &Peer) -> Result<(), FirewallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: &str) -> Self {
        if addr.contains(':') { Family::V6 } else { Family::V4 }
    }

    fn ipset_family(self) -> &'static str {
        match self {
            Family::V4 => "inet",
            Family::V6 => "inet6",
        }
    }

    fn iptables(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// ipset entries (`<ip>,<proto>:<port>`) for one family.
pub fn entries_for(peers: &[Peer], family: Family) -> BTreeSet<String> {
    peers
        .iter()
        .flat_map(|peer| peer_entries(peer, family))
        .collect()
}

fn peer_entries(peer: &Peer, family: Family) -> Vec<String> {
    let mut out = Vec::new();
    for addr in peer.addresses().filter(|a| Family::of(a) == family) {
        for port in &peer.ports {
            for proto in PROTOCOLS {
                out.push(format!("{},{}:{}", addr, proto, port));
            }
        }
    }
    out
}

/// Members listed by `ipset save <set>`.
pub fn parse_ipset_save(set: &str, output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("add"), Some(name), Some(entry)) if name == set => Some(entry.to_string()),
                _ => None,
            }
        })
        .collect()
}

pub struct IpsetPortforward {
    chain: String,
    ipset_v4: String,
    ipset_v6: String,
    runner: Arc<dyn CommandRunner>,
}

impl IpsetPortforward {
    /// Creates both sets if needed and makes sure the chain accepts their members.
    pub async fn new(
        config: &PortforwardingConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, FirewallError> {
        let pf = Self {
            chain: config.chain.clone(),
            ipset_v4: config.ipset_ipv4.clone(),
            ipset_v6: config.ipset_ipv6.clone(),
            runner,
        };
        for family in [Family::V4, Family::V6] {
            pf.init_family(family).await?;
        }
        info!(chain = %pf.chain, "portforwarding ready");
        Ok(pf)
    }

    fn set_name(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.ipset_v4,
            Family::V6 => &self.ipset_v6,
        }
    }

    async fn init_family(&self, family: Family) -> Result<(), FirewallError> {
        let set = self.set_name(family);
        self.runner
            .run(
                "ipset",
                &args(["create", "-exist", set, "hash:ip,port", "family", family.ipset_family()]),
            )
            .await?;

        let table = family.iptables();
        self.runner
            .run(table, &args(["-n", "-L", &self.chain]))
            .await
            .map_err(|_| FirewallError::MissingChain {
                chain: self.chain.clone(),
                table,
            })?;

        let rule = |op: &str| {
            args([op, &self.chain, "-m", "set", "--match-set", set, "dst,dst", "-j", "ACCEPT"])
        };
        if self.runner.run(table, &rule("-C")).await.is_err() {
            self.runner.run(table, &rule("-A")).await?;
            debug!(table, set, "added portforwarding rule");
        }
        Ok(())
    }

    async fn apply(&self, op: &str, family: Family, entry: &str) -> Result<(), FirewallError> {
        self.runner
            .run("ipset", &args([op, "-exist", self.set_name(family), entry]))
            .await?;
        Ok(())
    }

    async fn apply_peer(&self, op: &str, peer: &Peer) -> Result<(), FirewallError> {
        for family in [Family::V4, Family::V6] {
            for entry in peer_entries(peer, family) {
                self.apply(op, family, &entry).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallReconciler for IpsetPortforward {
    #[instrument(skip(self, desired), fields(operation = "update_portforwarding", desired = desired.len()))]
    async fn update_portforwarding(&self, desired: &[Peer]) -> Result<(), FirewallError> {
        for family in [Family::V4, Family::V6] {
            let set = self.set_name(family);
            let saved = self.runner.run("ipset", &args(["save", set])).await?;
            let current = parse_ipset_save(set, &saved);
            let wanted = entries_for(desired, family);

            for stale in current.difference(&wanted) {
                self.apply("del", family, stale).await?;
            }
            for missing in wanted.difference(&current) {
                self.apply("add", family, missing).await?;
            }
            debug!(
                set,
                added = wanted.difference(&current).count(),
                removed = current.difference(&wanted).count(),
                "portforwarding reconciled"
            );
        }
        Ok(())
    }

    #[instrument(skip(self, peer), fields(operation = "add_portforwarding", pubkey = %peer.pubkey))]
    async fn add_portforwarding(&self, peer: &Peer) -> Result<(), FirewallError> {
        self.apply_peer("add", peer).await
    }

    #[instrument(skip(self, peer), fields(operation = "remove_portforwarding", pubkey = %peer.pubkey))]
    async fn remove_portforwarding(&self, peer: &Peer) -> Result<(), FirewallError> {
        self.apply_peer("del", peer).await
    }
}
