//! TLS engines for intercepted CONNECT tunnels

use crate::config::MitmConfig;
use crate::error::{Error, Result};
use crate::tls::cert_gen::CertificateAuthority;
use crate::tls::config::{create_client_config, create_server_config};
use rustls::{ClientConfig, ServerConfig, ServerName};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Source of TLS engines for man-in-the-middle interception.
pub trait MitmManager: Send + Sync {
    /// Server-role engine presented to the client for `host`.
    fn new_server_engine(&self, host: &str) -> Result<TlsAcceptor>;

    /// Client-role engine used to reach the origin at `host`:`port`.
    fn new_client_engine(&self, host: &str, port: u16) -> Result<(TlsConnector, ServerName)>;
}

/// Signs per-host certificates with its own CA and caches the resulting
/// server configurations.
pub struct SelfSignedMitmManager {
    ca: CertificateAuthority,
    validity_days: u32,
    client_config: Arc<ClientConfig>,
    server_configs: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl SelfSignedMitmManager {
    pub fn new(ca: CertificateAuthority, validity_days: u32, client_config: Arc<ClientConfig>) -> Self {
        Self {
            ca,
            validity_days,
            client_config,
            server_configs: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &MitmConfig) -> anyhow::Result<Self> {
        let ca = CertificateAuthority::load_or_generate(config)?;
        let client_config = create_client_config(&[], config.skip_upstream_cert_verify)?;
        Ok(Self::new(ca, config.validity_days, client_config))
    }

    /// The CA clients must trust
    pub fn ca_certificate(&self) -> &rustls::Certificate {
        self.ca.certificate()
    }

    fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        let host = host.to_ascii_lowercase();
        if let Some(config) = self
            .server_configs
            .lock()
            .ok()
            .and_then(|configs| configs.get(&host).cloned())
        {
            return Ok(config);
        }

        debug!("Creating interception certificate for {}", host);
        let leaf = self
            .ca
            .issue(&host, self.validity_days)
            .map_err(|e| Error::Certificate(e.to_string()))?;
        let config = create_server_config(leaf.chain(), leaf.key)
            .map_err(|e| Error::Certificate(e.to_string()))?;

        if let Ok(mut configs) = self.server_configs.lock() {
            configs.insert(host, Arc::clone(&config));
        }
        Ok(config)
    }
}

impl MitmManager for SelfSignedMitmManager {
    fn new_server_engine(&self, host: &str) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(self.server_config(host)?))
    }

    fn new_client_engine(&self, host: &str, _port: u16) -> Result<(TlsConnector, ServerName)> {
        let server_name = ServerName::try_from(host)
            .map_err(|_| Error::Certificate(format!("invalid server name {:?}", host)))?;
        Ok((TlsConnector::from(Arc::clone(&self.client_config)), server_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SelfSignedMitmManager {
        let ca = CertificateAuthority::generate("Chain Proxy", 5).unwrap();
        let client_config = create_client_config(&[], true).unwrap();
        SelfSignedMitmManager::new(ca, 5, client_config)
    }

    #[test]
    fn test_server_configs_are_cached_per_host() {
        let manager = manager();
        let first = manager.server_config("Example.com").unwrap();
        let second = manager.server_config("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.new_server_engine("other.test").is_ok());
    }

    #[test]
    fn test_client_engine_accepts_ip_and_dns_names() {
        let manager = manager();
        assert!(manager.new_client_engine("example.com", 443).is_ok());
        assert!(manager.new_client_engine("127.0.0.1", 443).is_ok());
    }
}
