//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BEACON_HOST, BEACON_PORT)
//! - TOML configuration file
//!
//! Duration-valued keys are integers: the pool and socket timeouts are
//! milliseconds, the record TTLs and client intervals are seconds.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use beacon_core::RouterConfig;
use beacon_store::{KvSettings, PoolConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the WebSocket and update listeners.
    #[serde(default = "default_port")]
    pub port: u16,

    /// This node's identity, written to host mappings and used to build
    /// its routing URL.
    #[serde(default = "default_current_host")]
    pub current_host: String,

    /// Base64 (URL-safe) symmetric key for sealing endpoint tokens.
    /// Empty disables sealing and endpoint URLs carry plaintext IDs.
    #[serde(default)]
    pub token_key: String,

    /// Minimum seconds allowed between client pings.
    #[serde(default = "default_min_ping")]
    pub client_min_ping_interval: u64,

    /// Seconds a fresh socket may wait before sending hello.
    #[serde(default = "default_hello_timeout")]
    pub client_hello_timeout: u64,

    /// Seconds between keepalive probes; idle sockets past this window
    /// are closed unless `push_long_pongs` is set.
    #[serde(default = "default_pong_interval")]
    pub client_pong_interval: u64,

    /// Keep idle sockets open past the pong interval.
    #[serde(default)]
    pub push_long_pongs: bool,

    /// Maximum bytes of `data` accepted on an update.
    #[serde(default = "default_max_data_len")]
    pub max_data_len: usize,

    /// Storage configuration.
    #[serde(default)]
    pub store: StoreSection,

    /// Inter-node routing configuration.
    #[serde(default)]
    pub router: RouterSection,

    /// Push endpoint URL construction.
    #[serde(default)]
    pub endpoint: EndpointSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsSection,
}

/// Which backend the store talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Memcached-compatible service.
    Memcache,
    /// In-process table; single-node development only.
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Backend flavour.
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Backend `host:port` endpoints.
    #[serde(default = "default_store_hosts")]
    pub hosts: Vec<String>,

    /// Connections opened at init.
    #[serde(default = "default_min_conns")]
    pub min_conns: usize,

    /// Hard cap on open connections.
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// Milliseconds to wait for a free connection.
    #[serde(default = "default_store_timeout_ms")]
    pub pool_timeout: u64,

    /// Socket receive deadline in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub recv_timeout: u64,

    /// Socket send deadline in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub send_timeout: u64,

    /// Connection-establishment deadline in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub poll_timeout: u64,

    /// Backoff in milliseconds before retrying a failed connect.
    #[serde(default = "default_store_timeout_ms")]
    pub retry_timeout: u64,

    /// Live record TTL in seconds.
    #[serde(default = "default_timeout_live")]
    pub timeout_live: u64,

    /// Registered record TTL in seconds.
    #[serde(default = "default_timeout_reg")]
    pub timeout_reg: u64,

    /// Deleted record TTL in seconds.
    #[serde(default = "default_timeout_del")]
    pub timeout_del: u64,

    /// Key prefix for host mappings.
    #[serde(default = "default_host_prefix")]
    pub host_prefix: String,

    /// Key prefix for proprietary-ping blobs.
    #[serde(default = "default_ping_prefix")]
    pub ping_prefix: String,

    /// Host reported when no mapping exists for a device.
    #[serde(default = "default_default_host")]
    pub default_host: String,

    /// Attempts to mark a record deleted on unregister.
    #[serde(default = "default_unregister_retries")]
    pub unregister_retries: usize,

    /// Historical behaviour: report every device as existing.
    #[serde(default)]
    pub compat_exists: bool,

    /// Refuse version downgrades on update.
    #[serde(default)]
    pub enforce_monotonic_version: bool,
}

/// Inter-node routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    /// Port of the routing listener.
    #[serde(default = "default_router_port")]
    pub port: u16,

    /// Peer routing URLs; this node's own URL is filtered out.
    #[serde(default)]
    pub peers: Vec<String>,

    /// Milliseconds bounding one routed delivery.
    #[serde(default = "default_route_deadline_ms")]
    pub deadline: u64,
}

/// Push endpoint URL construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointSection {
    /// URL scheme.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Public host; defaults to `current_host`.
    #[serde(default)]
    pub host: String,

    /// Public port; defaults to the main listener port.
    #[serde(default)]
    pub port: u16,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSection {
    /// Enable the Prometheus exporter.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("BEACON_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BEACON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_current_host() -> String {
    "localhost".to_string()
}

fn default_min_ping() -> u64 {
    20
}

fn default_hello_timeout() -> u64 {
    30
}

fn default_pong_interval() -> u64 {
    300
}

fn default_max_data_len() -> usize {
    4096
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memcache
}

fn default_store_hosts() -> Vec<String> {
    vec!["localhost:11211".to_string()]
}

fn default_min_conns() -> usize {
    100
}

fn default_max_conns() -> usize {
    400
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_timeout_live() -> u64 {
    3 * 24 * 60 * 60
}

fn default_timeout_reg() -> u64 {
    3 * 60 * 60
}

fn default_timeout_del() -> u64 {
    24 * 60 * 60
}

fn default_host_prefix() -> String {
    "_h-".to_string()
}

fn default_ping_prefix() -> String {
    "_pc-".to_string()
}

fn default_default_host() -> String {
    "localhost".to_string()
}

fn default_unregister_retries() -> usize {
    3
}

fn default_router_port() -> u16 {
    3000
}

fn default_route_deadline_ms() -> u64 {
    3000
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            current_host: default_current_host(),
            token_key: String::new(),
            client_min_ping_interval: default_min_ping(),
            client_hello_timeout: default_hello_timeout(),
            client_pong_interval: default_pong_interval(),
            push_long_pongs: false,
            max_data_len: default_max_data_len(),
            store: StoreSection::default(),
            router: RouterSection::default(),
            endpoint: EndpointSection::default(),
            metrics: MetricsSection::default(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            hosts: default_store_hosts(),
            min_conns: default_min_conns(),
            max_conns: default_max_conns(),
            pool_timeout: default_store_timeout_ms(),
            recv_timeout: default_store_timeout_ms(),
            send_timeout: default_store_timeout_ms(),
            poll_timeout: default_store_timeout_ms(),
            retry_timeout: default_store_timeout_ms(),
            timeout_live: default_timeout_live(),
            timeout_reg: default_timeout_reg(),
            timeout_del: default_timeout_del(),
            host_prefix: default_host_prefix(),
            ping_prefix: default_ping_prefix(),
            default_host: default_default_host(),
            unregister_retries: default_unregister_retries(),
            compat_exists: false,
            enforce_monotonic_version: false,
        }
    }
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            port: default_router_port(),
            peers: Vec::new(),
            deadline: default_route_deadline_ms(),
        }
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default file locations, falling back
    /// to defaults with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "beacon.toml",
            "/etc/beacon/beacon.toml",
            "~/.config/beacon/beacon.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The socket address of the WebSocket/update listener.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// The socket address of the routing listener.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn router_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.router.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.router.port))
    }

    /// This node's advertised routing URL.
    #[must_use]
    pub fn route_url(&self) -> String {
        format!("http://{}:{}", self.current_host, self.router.port)
    }

    /// Base URL for issued push endpoints.
    #[must_use]
    pub fn endpoint_base(&self) -> String {
        let scheme = if self.endpoint.scheme.is_empty() {
            default_scheme()
        } else {
            self.endpoint.scheme.clone()
        };
        let host = if self.endpoint.host.is_empty() {
            &self.current_host
        } else {
            &self.endpoint.host
        };
        let port = if self.endpoint.port == 0 {
            self.port
        } else {
            self.endpoint.port
        };
        format!("{scheme}://{host}:{port}")
    }

    /// Decode the configured token key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is present but not valid base64.
    pub fn token_key_bytes(&self) -> Result<Option<Vec<u8>>> {
        if self.token_key.is_empty() {
            return Ok(None);
        }
        match URL_SAFE_NO_PAD.decode(self.token_key.trim_end_matches('=')) {
            Ok(key) => Ok(Some(key)),
            Err(err) => bail!("Malformed token key: {err}"),
        }
    }

    /// Client hello deadline.
    #[must_use]
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_secs(self.client_hello_timeout)
    }

    /// Minimum interval between client pings.
    #[must_use]
    pub fn min_ping(&self) -> Duration {
        Duration::from_secs(self.client_min_ping_interval)
    }

    /// Keepalive probe interval.
    #[must_use]
    pub fn pong_interval(&self) -> Duration {
        Duration::from_secs(self.client_pong_interval)
    }

    /// Store behaviour knobs.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            host_prefix: self.store.host_prefix.clone(),
            ping_prefix: self.store.ping_prefix.clone(),
            default_host: self.store.default_host.clone(),
            ttl_live: Duration::from_secs(self.store.timeout_live),
            ttl_registered: Duration::from_secs(self.store.timeout_reg),
            ttl_deleted: Duration::from_secs(self.store.timeout_del),
            unregister_retries: self.store.unregister_retries,
            compat_exists: self.store.compat_exists,
            enforce_monotonic_version: self.store.enforce_monotonic_version,
        }
    }

    /// Pool sizing and wait policy.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_conns: self.store.min_conns,
            max_conns: self.store.max_conns,
            pool_timeout: Duration::from_millis(self.store.pool_timeout),
        }
    }

    /// Connection timeout envelope.
    #[must_use]
    pub fn kv_settings(&self) -> KvSettings {
        KvSettings {
            send_timeout: Duration::from_millis(self.store.send_timeout),
            recv_timeout: Duration::from_millis(self.store.recv_timeout),
            poll_timeout: Duration::from_millis(self.store.poll_timeout),
            retry_timeout: Duration::from_millis(self.store.retry_timeout),
        }
    }

    /// Router deadline and identity.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            deadline: Duration::from_millis(self.router.deadline),
            self_url: self.route_url(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client_min_ping_interval, 20);
        assert_eq!(config.client_hello_timeout, 30);
        assert_eq!(config.client_pong_interval, 300);
        assert!(!config.push_long_pongs);
        assert_eq!(config.store.min_conns, 100);
        assert_eq!(config.store.max_conns, 400);
        assert_eq!(config.store.timeout_live, 259_200);
        assert_eq!(config.store.timeout_reg, 10_800);
        assert_eq!(config.store.timeout_del, 86_400);
        assert_eq!(config.router.port, 3000);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            current_host = "push-1.internal"
            client_min_ping_interval = 10

            [store]
            backend = "memory"
            min_conns = 5
            max_conns = 10

            [router]
            port = 3001
            peers = ["http://push-2.internal:3001"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.min_conns, 5);
        assert_eq!(config.router.peers.len(), 1);
        assert_eq!(config.route_url(), "http://push-1.internal:3001");
        assert_eq!(config.min_ping(), Duration::from_secs(10));
    }

    #[test]
    fn test_endpoint_base_defaults() {
        let mut config = Config::default();
        config.current_host = "push.example.com".to_string();
        config.port = 8080;
        assert_eq!(config.endpoint_base(), "http://push.example.com:8080");

        config.endpoint.scheme = "https".to_string();
        config.endpoint.host = "endpoint.example.com".to_string();
        config.endpoint.port = 443;
        assert_eq!(config.endpoint_base(), "https://endpoint.example.com:443");
    }

    #[test]
    fn test_token_key_decoding() {
        let mut config = Config::default();
        assert!(config.token_key_bytes().unwrap().is_none());

        config.token_key = URL_SAFE_NO_PAD.encode([7u8; 32]);
        assert_eq!(config.token_key_bytes().unwrap().unwrap(), vec![7u8; 32]);

        config.token_key = "!!".to_string();
        assert!(config.token_key_bytes().is_err());
    }
}
