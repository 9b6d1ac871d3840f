//! Proxy configuration settings

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};

/// Main configuration for the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Server listening address
    pub listen_addr: SocketAddr,

    /// Listen on the loopback address only, keeping the port of `listen_addr`
    pub allow_local_only: bool,

    /// Listen on every local address, keeping the port of `listen_addr`
    pub listen_on_all_addresses: bool,

    /// Local address outbound connections are bound to
    pub network_interface: Option<IpAddr>,

    /// Bandwidth limits shared by all connections
    pub throttling: ThrottlingConfig,

    /// Log level configuration
    pub log_level: String,

    /// Pseudonym used in `Via` headers; the local host name when unset
    pub proxy_alias: Option<String>,

    /// Relay messages without any proxy header rewriting
    pub transparent: bool,

    /// Accept origin-form requests (`GET /path`) as if the proxy were the origin
    pub allow_requests_to_origin_server: bool,

    /// Idle timeout for client and server connections in seconds (0 disables)
    pub idle_connection_timeout_secs: u64,

    /// Outbound TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// How long a writer waits for an outbound connection flow to finish
    pub flow_wait_timeout_secs: u64,

    /// Grace period for in-flight connections on shutdown
    pub shutdown_grace_secs: u64,

    /// Maximum length of a request or status line
    pub max_initial_line_length: usize,

    /// Maximum size of a message head in bytes
    pub max_header_size: usize,

    /// Maximum number of header fields in a message
    pub max_headers: usize,

    /// Socket read buffer size
    pub read_buffer_size: usize,

    /// Outbound buffer thresholds that drive saturation
    pub write_buffer: WriteBufferConfig,

    /// Proxy authentication
    pub authentication: AuthConfig,

    /// TLS interception of CONNECT tunnels
    pub mitm: MitmConfig,

    /// Ordered upstream proxies; the first one is tried, then direct
    pub chained_proxies: Vec<ChainedProxyConfig>,

    /// Destination host suffixes that should go through the chain (empty = all)
    pub chain_hosts: Vec<String>,

    /// HAProxy PROXY protocol v1 handling
    pub proxy_protocol: ProxyProtocolConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Runtime configuration
    pub runtime: RuntimeConfig,
}

/// Bytes per second, 0 meaning unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    pub read_bytes_per_second: u64,
    pub write_bytes_per_second: u64,
}

impl ThrottlingConfig {
    pub fn is_enabled(&self) -> bool {
        self.read_bytes_per_second > 0 || self.write_bytes_per_second > 0
    }
}

/// Outbound buffer water marks in bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBufferConfig {
    pub high_water_mark: usize,
    pub low_water_mark: usize,
}

/// Basic proxy authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
    pub realm: String,
}

/// TLS interception configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MitmConfig {
    /// Terminate and re-establish TLS on CONNECT tunnels
    pub enabled: bool,

    /// CA certificate used to sign per-host certificates (PEM); generated in memory when missing
    pub ca_cert_path: Option<String>,

    /// CA private key (PEM)
    pub ca_key_path: Option<String>,

    /// Organization name for generated certificates
    pub organization: String,

    /// Validity of generated certificates in days
    pub validity_days: u32,

    /// Skip upstream certificate verification (for testing)
    pub skip_upstream_cert_verify: bool,
}

/// One upstream proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainedProxyConfig {
    /// `host:port` or `http://host:port` / `https://host:port`
    pub address: String,

    /// Speak TLS to the chained proxy itself
    pub requires_encryption: bool,

    /// SNI name for the TLS session; the address host when unset
    pub server_name: Option<String>,

    /// Transport used to reach the proxy
    pub transport: String,
}

/// PROXY protocol v1 handling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyProtocolConfig {
    /// Expect a PROXY header on accepted connections
    pub accept: bool,

    /// Send a PROXY header on outbound connections
    pub send: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write logs to a daily rolling file
    pub enable_file_logging: bool,

    /// Directory for log files
    pub log_dir: String,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime mode: "single_threaded" or "multi_threaded"
    pub mode: String,

    /// Number of worker threads for multi-threaded mode (0 = auto-detect CPU cores)
    pub worker_threads: Option<usize>,

    /// Use SO_REUSEPORT on the listening socket (Linux/macOS)
    pub use_reuseport: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            allow_local_only: false,
            listen_on_all_addresses: false,
            network_interface: None,
            throttling: ThrottlingConfig::default(),
            log_level: "info".to_string(),
            proxy_alias: None,
            transparent: false,
            allow_requests_to_origin_server: false,
            idle_connection_timeout_secs: 70,
            connect_timeout_secs: 40,
            flow_wait_timeout_secs: 30,
            shutdown_grace_secs: 10,
            max_initial_line_length: 8192,
            max_header_size: 16384,
            max_headers: 100,
            read_buffer_size: 16384,
            write_buffer: WriteBufferConfig::default(),
            authentication: AuthConfig::default(),
            mitm: MitmConfig::default(),
            chained_proxies: Vec::new(),
            chain_hosts: Vec::new(),
            proxy_protocol: ProxyProtocolConfig::default(),
            logging: LoggingConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 64 * 1024,
            low_water_mark: 32 * 1024,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: String::new(),
            password: String::new(),
            realm: "Restricted Files".to_string(),
        }
    }
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_path: None,
            ca_key_path: None,
            organization: "Chain Proxy".to_string(),
            validity_days: 365,
            skip_upstream_cert_verify: false,
        }
    }
}

impl Default for ChainedProxyConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            requires_encryption: false,
            server_name: None,
            transport: "tcp".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_file_logging: false,
            log_dir: "logs".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: "multi_threaded".to_string(),
            worker_threads: None, // Auto-detect CPU cores
            use_reuseport: false,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: ProxyConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load configuration from an optional YAML file, then apply environment overrides
    ///
    /// Without an explicit path `config.yml` is used when present; otherwise the
    /// defaults are the starting point.
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new("config.yml").exists() => Self::from_yaml_file("config.yml")?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Configuration from defaults plus environment variables only
    pub fn from_env_vars() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Override fields from environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr_str) = std::env::var("PROXY_LISTEN_ADDR") {
            if let Ok(addr) = addr_str.parse() {
                self.listen_addr = addr;
            }
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.log_level = log_level;
        }

        if let Ok(alias) = std::env::var("PROXY_ALIAS") {
            self.proxy_alias = Some(alias);
        }

        if let Ok(timeout) = std::env::var("PROXY_IDLE_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                self.idle_connection_timeout_secs = timeout;
            }
        }

        if let Ok(timeout) = std::env::var("PROXY_CONNECT_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                self.connect_timeout_secs = timeout;
            }
        }

        if let Ok(enabled) = std::env::var("PROXY_MITM_ENABLED") {
            self.mitm.enabled = enabled.to_lowercase() == "true";
        }

        if let Ok(username) = std::env::var("PROXY_AUTH_USERNAME") {
            self.authentication.enabled = true;
            self.authentication.username = username;
        }

        if let Ok(password) = std::env::var("PROXY_AUTH_PASSWORD") {
            self.authentication.password = password;
        }

        if let Ok(address) = std::env::var("PROXY_CHAINED_PROXY") {
            self.chained_proxies = vec![ChainedProxyConfig {
                address,
                ..ChainedProxyConfig::default()
            }];
        }

        if let Ok(mode) = std::env::var("PROXY_RUNTIME_MODE") {
            self.runtime.mode = mode;
        }

        if let Ok(threads) = std::env::var("PROXY_WORKER_THREADS") {
            if let Ok(threads) = threads.parse() {
                self.runtime.worker_threads = Some(threads);
            }
        }

        if let Ok(reuseport) = std::env::var("PROXY_USE_REUSEPORT") {
            self.runtime.use_reuseport = reuseport.to_lowercase() == "true";
        }

        if let Ok(local_only) = std::env::var("PROXY_ALLOW_LOCAL_ONLY") {
            self.allow_local_only = local_only.to_lowercase() == "true";
        }

        if let Ok(interface) = std::env::var("PROXY_NETWORK_INTERFACE") {
            if let Ok(interface) = interface.parse() {
                self.network_interface = Some(interface);
            }
        }

        if let Ok(limit) = std::env::var("PROXY_READ_THROTTLE") {
            if let Ok(limit) = limit.parse() {
                self.throttling.read_bytes_per_second = limit;
            }
        }

        if let Ok(limit) = std::env::var("PROXY_WRITE_THROTTLE") {
            if let Ok(limit) = limit.parse() {
                self.throttling.write_bytes_per_second = limit;
            }
        }
    }

    /// Reject settings the connections cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer.high_water_mark == 0 {
            return Err(anyhow!("write_buffer.high_water_mark must be greater than 0"));
        }
        if self.write_buffer.low_water_mark >= self.write_buffer.high_water_mark {
            return Err(anyhow!(
                "write_buffer.low_water_mark ({}) must be below high_water_mark ({})",
                self.write_buffer.low_water_mark,
                self.write_buffer.high_water_mark
            ));
        }
        if self.allow_local_only && self.listen_on_all_addresses {
            return Err(anyhow!(
                "allow_local_only and listen_on_all_addresses cannot both be set"
            ));
        }
        if let Some(interface) = self.network_interface {
            if interface.is_unspecified() {
                return Err(anyhow!("network_interface must be a concrete local address"));
            }
        }
        if self.authentication.enabled && self.authentication.username.is_empty() {
            return Err(anyhow!("authentication is enabled but no username is configured"));
        }
        for proxy in &self.chained_proxies {
            if proxy.address.trim().is_empty() {
                return Err(anyhow!("chained proxy address cannot be empty"));
            }
        }
        match self.runtime.mode.as_str() {
            "single_threaded" | "multi_threaded" => {}
            other => return Err(anyhow!("Invalid runtime mode: {}", other)),
        }
        Ok(())
    }

    /// Address the listener binds to: `listen_addr`, narrowed to loopback by
    /// `allow_local_only` or widened to every address by `listen_on_all_addresses`.
    pub fn bind_addr(&self) -> SocketAddr {
        let port = self.listen_addr.port();
        let ip = if self.allow_local_only {
            match self.listen_addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            }
        } else if self.listen_on_all_addresses {
            match self.listen_addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            }
        } else {
            self.listen_addr.ip()
        };
        SocketAddr::new(ip, port)
    }

    /// Idle timeout, or `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_connection_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn flow_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_wait_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Alias placed in `Via` headers
    pub fn resolved_alias(&self) -> String {
        if let Some(alias) = self.proxy_alias.as_ref().filter(|alias| !alias.trim().is_empty()) {
            return alias.clone();
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
            })
            .unwrap_or_else(|| "chain-proxy".to_string())
    }
}
