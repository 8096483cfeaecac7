use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_DOMAIN, DEFAULT_MULTICAST_TTL, MDNS_ENDPOINT_V4};

/// Engine configuration. Every field has a default, so an empty file (or no
/// file at all) yields a working setup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Browse re-query period; the first query goes out immediately
    #[serde(default = "default_query_interval")]
    pub query_interval_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    /// How long a resolve waits for SRV data before failing
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_ms: u64,
    /// Resolve every instance as soon as it is found
    #[serde(default)]
    pub auto_resolve: bool,
    /// Send browse queries. When off the session only merges unsolicited
    /// announcements.
    #[serde(default = "default_active_queries")]
    pub active_queries: bool,
    #[serde(default = "default_domain")]
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_group")]
    pub group: SocketAddrV4,
    /// Local interface address used for the multicast membership
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
    #[serde(default = "default_multicast_loop")]
    pub multicast_loop: bool,
    /// SO_RCVBUF override; the OS default is kept when unset
    #[serde(default)]
    pub recv_buffer_size: Option<usize>,
}

fn default_query_interval() -> u64 {
    4000
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_resolve_timeout() -> u64 {
    3000
}

fn default_active_queries() -> bool {
    true
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_group() -> SocketAddrV4 {
    MDNS_ENDPOINT_V4
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_multicast_ttl() -> u32 {
    DEFAULT_MULTICAST_TTL
}

fn default_multicast_loop() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            query_interval_ms: default_query_interval(),
            sweep_interval_ms: default_sweep_interval(),
            resolve_timeout_ms: default_resolve_timeout(),
            auto_resolve: false,
            active_queries: default_active_queries(),
            domain: default_domain(),
        }
    }
}

impl SessionConfig {
    pub fn query_interval(&self) -> Duration {
        Duration::from_millis(self.query_interval_ms)
    }

    /// Browse re-query period, or None in passive mode
    pub fn query_schedule(&self) -> Option<Duration> {
        self.active_queries.then(|| self.query_interval())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            interface: default_interface(),
            multicast_ttl: default_multicast_ttl(),
            multicast_loop: default_multicast_loop(),
            recv_buffer_size: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        anyhow::ensure!(
            config.session.query_interval_ms > 0 && config.session.sweep_interval_ms > 0,
            "session intervals must be non-zero"
        );
        anyhow::ensure!(
            config.transport.group.ip().is_multicast(),
            "{} is not a multicast group",
            config.transport.group
        );
        Ok(config)
    }
}
