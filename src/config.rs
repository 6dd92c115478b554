use crate::load_sampler::MIN_SAMPLE_INTERVAL;
use serde::Deserialize;
use std::time::Duration;

/// Prefix for environment overrides (`WG_URL`, `WG_PASSWORD`, ...).
pub const ENV_PREFIX: &str = "WG_";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub api: ApiConfig,
    pub wireguard: WireguardConfig,
    pub portforwarding: PortforwardingConfig,
    pub mq: MqConfig,
    pub load: LoadConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How often peers are synchronized with the API.
    pub interval_secs: u64,
    /// Max random delay added to or removed from each interval.
    pub delay_secs: u64,
    /// How often to log reconciliation counters at INFO level.
    pub stats_log_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            delay_secs: 45,
            stats_log_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub admin_url: String,
    pub username: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "https://api.connectvpn.net/v1".into(),
            admin_url: "https://connectvpn.net/api".into(),
            username: String::new(),
            password: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    pub interfaces: Vec<String>,
    /// A peer counts as connected if its last handshake is newer than this.
    pub handshake_timeout_secs: u64,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            interfaces: vec!["wg0".into()],
            handshake_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortforwardingConfig {
    pub chain: String,
    pub ipset_ipv4: String,
    pub ipset_ipv6: String,
}

impl Default for PortforwardingConfig {
    fn default() -> Self {
        Self {
            chain: "PORTFORWARDING".into(),
            ipset_ipv4: "PORTFORWARDING_IPV4".into(),
            ipset_ipv6: "PORTFORWARDING_IPV6".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub channel: String,
    pub reconnect_delay_secs: u64,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:1323/v1".into(),
            username: String::new(),
            password: String::new(),
            channel: "main".into(),
            reconnect_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Interface to measure. Unset means the first physical (PCI) NIC.
    pub interface: Option<String>,
    pub sample_interval_ms: u64,
    /// Upper bound on one sampling call, including retries for a missing interface.
    pub sample_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the Prometheus /metrics endpoint. Empty disables it.
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9586".into(),
        }
    }
}

impl MetricsConfig {
    pub fn enabled(&self) -> bool {
        !self.listen.trim().is_empty()
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            interface: None,
            sample_interval_ms: 2000,
            sample_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

impl AppConfig {
    /// Load from `CONFIG_FILE` (default `config.toml`), then apply `WG_*` overrides.
    /// A missing default file yields built-in defaults; an explicit path must exist.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = std::env::var("CONFIG_FILE").ok();
        let path = explicit.clone().unwrap_or_else(|| "config.toml".into());
        let mut config: AppConfig = match std::fs::read_to_string(&path) {
            Ok(s) => toml::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                AppConfig::default()
            }
            Err(e) => return Err(anyhow::anyhow!("reading {}: {}", path, e)),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate config from a string (e.g. for tests).
    pub fn load_from_str(s: &str) -> anyhow::Result<Self> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WG_*` overrides using `lookup` (normally `std::env::var`).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("URL") {
            self.api.url = v;
        }
        if let Some(v) = get("ADMIN_URL") {
            self.api.admin_url = v;
        }
        if let Some(v) = get("USERNAME") {
            self.api.username = v;
        }
        if let Some(v) = get("PASSWORD") {
            self.api.password = v;
        }
        if let Some(v) = get("INTERFACES") {
            self.wireguard.interfaces = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("MQ_URL") {
            self.mq.url = v;
        }
        if let Some(v) = get("MQ_USERNAME") {
            self.mq.username = v;
        }
        if let Some(v) = get("MQ_PASSWORD") {
            self.mq.password = v;
        }
        if let Some(v) = get("MQ_CHANNEL") {
            self.mq.channel = v;
        }
        if let Some(v) = get("METRICS_LISTEN") {
            self.metrics.listen = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.sync.interval_secs > 0,
            "sync.interval_secs must be > 0, got {}",
            self.sync.interval_secs
        );
        anyhow::ensure!(
            self.sync.stats_log_interval_secs > 0,
            "sync.stats_log_interval_secs must be > 0, got {}",
            self.sync.stats_log_interval_secs
        );
        anyhow::ensure!(!self.api.url.is_empty(), "api.url must be non-empty");
        anyhow::ensure!(
            !self.api.admin_url.is_empty(),
            "api.admin_url must be non-empty"
        );
        anyhow::ensure!(
            self.api.timeout_secs > 0,
            "api.timeout_secs must be > 0, got {}",
            self.api.timeout_secs
        );
        anyhow::ensure!(
            self.wireguard.interfaces.iter().any(|i| !i.trim().is_empty()),
            "no wireguard interfaces configured"
        );
        anyhow::ensure!(
            !self.portforwarding.chain.is_empty(),
            "portforwarding.chain must be non-empty"
        );
        anyhow::ensure!(
            !self.portforwarding.ipset_ipv4.is_empty() && !self.portforwarding.ipset_ipv6.is_empty(),
            "portforwarding.ipset_ipv4 and portforwarding.ipset_ipv6 must be non-empty"
        );
        anyhow::ensure!(!self.mq.url.is_empty(), "mq.url must be non-empty");
        anyhow::ensure!(!self.mq.channel.is_empty(), "mq.channel must be non-empty");
        let effective_interval_ms = self
            .load
            .sample_interval_ms
            .max(MIN_SAMPLE_INTERVAL.as_millis() as u64);
        anyhow::ensure!(
            self.load.sample_timeout_ms >= effective_interval_ms,
            "load.sample_timeout_ms ({}) must be >= the effective sample interval ({} ms)",
            self.load.sample_timeout_ms,
            effective_interval_ms
        );
        if self.metrics.enabled() {
            anyhow::ensure!(
                self.metrics.listen.parse::<std::net::SocketAddr>().is_ok(),
                "metrics.listen must be host:port, got {:?}",
                self.metrics.listen
            );
        }
        Ok(())
    }
}
