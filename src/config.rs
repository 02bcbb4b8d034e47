//! Configuration types for consul-dns.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::DnsError;

/// Listen address used for the metrics endpoint when none is configured.
pub const DEFAULT_METRICS_LISTEN: &str = ":9234";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address for the DNS server to listen on (UDP).
    #[serde(default)]
    pub bind: String,

    /// Address for the Prometheus metrics endpoint.
    #[serde(default = "default_metrics_listen")]
    pub metrics_listen: String,

    /// Zone this server is authoritative for (e.g. "service.example").
    #[serde(default)]
    pub zone: String,

    /// Services to monitor. Each is served as `<service>.<zone>.`.
    #[serde(default)]
    pub services: Vec<String>,

    /// Consul registry configuration.
    #[serde(default)]
    pub consul: ConsulConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Consul registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    /// Base URL of the Consul HTTP API.
    #[serde(default = "default_consul_address")]
    pub address: String,

    /// Datacenter to query; the agent's own datacenter when unset.
    #[serde(default)]
    pub datacenter: Option<String>,

    /// ACL token sent as `X-Consul-Token`.
    #[serde(default)]
    pub token: Option<String>,

    /// Maximum blocking-query wait in seconds.
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    /// Minimum delay between two fetches for the same service, in milliseconds.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "consul_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_consul_address(),
            datacenter: None,
            token: None,
            wait_secs: default_wait_secs(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

impl ConsulConfig {
    /// Blocking-query wait as a duration.
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    /// Per-service fetch rate limit as a duration.
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_metrics_listen() -> String {
    DEFAULT_METRICS_LISTEN.to_string()
}

fn default_consul_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_wait_secs() -> u64 {
    300
}

fn default_min_interval_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML or YAML file, with `CONSUL_DNS__*`
    /// environment overrides, and validate it.
    pub fn load(path: &Path) -> Result<Self, DnsError> {
        let mut config: Config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("CONSUL_DNS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check required fields and fill in defaults for optional empty ones.
    pub fn validate(&mut self) -> Result<(), DnsError> {
        if self.bind.is_empty() {
            return Err(DnsError::Config("'bind' is not set".to_string()));
        }

        self.zone = normalize_zone(&self.zone);
        if self.zone.is_empty() {
            return Err(DnsError::Config("'zone' is not set".to_string()));
        }

        if self.metrics_listen.is_empty() {
            self.metrics_listen = default_metrics_listen();
        }

        if self.services.is_empty() {
            return Err(DnsError::Config("'services' must be defined".to_string()));
        }

        if let Some(service) = self.services.iter().find(|s| !is_valid_service_name(s)) {
            return Err(DnsError::Config(format!(
                "invalid service name {service:?}: only letters, digits, '-' and '_' are allowed"
            )));
        }

        Ok(())
    }

    /// Resolved DNS listen address.
    pub fn bind_addr(&self) -> Result<SocketAddr, DnsError> {
        parse_listen_addr(&self.bind)
    }

    /// Resolved metrics listen address.
    pub fn metrics_addr(&self) -> Result<SocketAddr, DnsError> {
        parse_listen_addr(&self.metrics_listen)
    }
}

/// Service names become both a DNS label and a registry URL path segment.
fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Strip surrounding dots and lowercase a zone name.
pub fn normalize_zone(zone: &str) -> String {
    zone.trim().trim_matches('.').to_ascii_lowercase()
}

/// Parse a listen address. A bare `:port` binds all IPv4 interfaces.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, DnsError> {
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| DnsError::InvalidAddress(addr.to_string()))?;
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    addr.parse()
        .map_err(|_| DnsError::InvalidAddress(addr.to_string()))
}
