//! Chained (upstream) proxies

use crate::config::{ChainedProxyConfig, ProxyConfig};
use crate::models::HttpRequest;
use crate::utils::split_host_and_port;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_PROXY_PORT: u16 = 3128;

/// An upstream proxy requests can be sent through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedProxy {
    /// `host:port` of the upstream proxy
    pub address: String,
    pub requires_encryption: bool,
    pub server_name: Option<String>,
    pub transport: String,
}

impl ChainedProxy {
    pub fn host_and_port(&self) -> Option<(String, u16)> {
        split_host_and_port(&self.address, DEFAULT_PROXY_PORT)
    }

    /// Name to verify the proxy's certificate against.
    pub fn tls_server_name(&self) -> String {
        match &self.server_name {
            Some(name) => name.clone(),
            None => self
                .host_and_port()
                .map(|(host, _)| host)
                .unwrap_or_else(|| self.address.clone()),
        }
    }
}

/// Normalize `host:port` or an `http://` / `https://` URL to `host:port`.
/// The second value is true for `https`.
fn normalize_address(address: &str) -> (String, bool) {
    if !address.contains("://") {
        return (address.to_string(), false);
    }
    match Url::parse(address) {
        Ok(url) => match url.host_str() {
            Some(host) => {
                let port = url.port_or_known_default().unwrap_or(DEFAULT_PROXY_PORT);
                (format!("{}:{}", host, port), url.scheme() == "https")
            }
            None => (address.to_string(), false),
        },
        Err(e) => {
            warn!("Invalid chained proxy address {:?}: {}", address, e);
            (address.to_string(), false)
        }
    }
}

impl From<&ChainedProxyConfig> for ChainedProxy {
    fn from(config: &ChainedProxyConfig) -> Self {
        let (address, https) = normalize_address(&config.address);
        Self {
            address,
            requires_encryption: config.requires_encryption || https,
            server_name: config.server_name.clone(),
            transport: config.transport.clone(),
        }
    }
}

/// Decides which upstream proxies a request goes through.
pub trait ChainedProxyManager: Send + Sync {
    /// Ordered candidates for `request` to `host_and_port`; empty means direct.
    fn lookup_chained_proxies(&self, request: &HttpRequest, host_and_port: &str) -> Vec<ChainedProxy>;

    /// Reported once per failed attempt through the proxy at `host_and_port`.
    fn on_communication_error(&self, host_and_port: &str);
}

/// Chained proxies taken from the configuration file.
///
/// When `chain_hosts` is non-empty only destinations whose host ends with one
/// of the listed suffixes are chained.
pub struct ConfiguredChainedProxies {
    proxies: Vec<ChainedProxy>,
    chain_hosts: Vec<String>,
    errors: Mutex<HashMap<String, u64>>,
}

impl ConfiguredChainedProxies {
    pub fn new(proxies: Vec<ChainedProxy>, chain_hosts: Vec<String>) -> Self {
        Self {
            proxies,
            chain_hosts: chain_hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect(),
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// `None` when the configuration lists no chained proxies.
    pub fn from_config(config: &ProxyConfig) -> Option<Self> {
        if config.chained_proxies.is_empty() {
            return None;
        }
        let proxies = config.chained_proxies.iter().map(ChainedProxy::from).collect();
        Some(Self::new(proxies, config.chain_hosts.clone()))
    }

    /// Failures recorded for the proxy at `address`
    pub fn communication_errors(&self, address: &str) -> u64 {
        self.errors
            .lock()
            .map(|errors| errors.get(address).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn applies_to(&self, host_and_port: &str) -> bool {
        if self.chain_hosts.is_empty() {
            return true;
        }
        let host = split_host_and_port(host_and_port, 80)
            .map(|(host, _)| host.to_ascii_lowercase())
            .unwrap_or_default();
        self.chain_hosts
            .iter()
            .any(|suffix| host == *suffix || host.ends_with(&format!(".{}", suffix)))
    }
}

impl ChainedProxyManager for ConfiguredChainedProxies {
    fn lookup_chained_proxies(&self, request: &HttpRequest, host_and_port: &str) -> Vec<ChainedProxy> {
        if !self.applies_to(host_and_port) {
            debug!("Not chaining {} {}", request.method, host_and_port);
            return Vec::new();
        }
        self.proxies.clone()
    }

    fn on_communication_error(&self, host_and_port: &str) {
        warn!("⚠️  Communication error with chained proxy {}", host_and_port);
        if let Ok(mut errors) = self.errors.lock() {
            *errors.entry(host_and_port.to_string()).or_insert(0) += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Version};

    fn proxy(address: &str) -> ChainedProxy {
        ChainedProxy {
            address: address.to_string(),
            requires_encryption: false,
            server_name: None,
            transport: "tcp".to_string(),
        }
    }

    #[test]
    fn test_chain_hosts_restrict_lookup() {
        let manager = ConfiguredChainedProxies::new(
            vec![proxy("upstream:3128")],
            vec!["Example.com".to_string()],
        );
        let request = HttpRequest::new(Method::GET, "/", Version::HTTP_11);
        assert_eq!(manager.lookup_chained_proxies(&request, "www.example.com:80").len(), 1);
        assert_eq!(manager.lookup_chained_proxies(&request, "example.com:443").len(), 1);
        assert!(manager.lookup_chained_proxies(&request, "notexample.com:80").is_empty());
    }

    #[test]
    fn test_communication_errors_are_counted() {
        let manager = ConfiguredChainedProxies::new(vec![proxy("upstream:3128")], Vec::new());
        manager.on_communication_error("upstream:3128");
        manager.on_communication_error("upstream:3128");
        assert_eq!(manager.communication_errors("upstream:3128"), 2);
        assert_eq!(manager.communication_errors("other:1"), 0);
    }

    #[test]
    fn test_tls_server_name_defaults_to_host() {
        let mut p = proxy("secure.upstream:8443");
        assert_eq!(p.tls_server_name(), "secure.upstream");
        assert_eq!(p.host_and_port(), Some(("secure.upstream".to_string(), 8443)));
        p.server_name = Some("proxy.corp".to_string());
        assert_eq!(p.tls_server_name(), "proxy.corp");
    }

    #[test]
    fn test_url_addresses_are_normalized() {
        let config = ChainedProxyConfig {
            address: "https://secure.upstream:8443".to_string(),
            ..Default::default()
        };
        let p = ChainedProxy::from(&config);
        assert_eq!(p.address, "secure.upstream:8443");
        assert!(p.requires_encryption);

        let config = ChainedProxyConfig {
            address: "http://plain.upstream".to_string(),
            ..Default::default()
        };
        let p = ChainedProxy::from(&config);
        assert_eq!(p.address, "plain.upstream:80");
        assert!(!p.requires_encryption);
    }

    #[test]
    fn test_no_proxies_means_no_manager() {
        assert!(ConfiguredChainedProxies::from_config(&ProxyConfig::default()).is_none());
    }
}
