//! Collaborators and settings shared by every connection of one server

use crate::config::ProxyConfig;
use crate::proxy::activity::ActivityTracker;
use crate::proxy::auth::ProxyAuthenticator;
use crate::proxy::chain::ChainedProxyManager;
use crate::proxy::codec::{CodecLimits, Role};
use crate::proxy::connection::Connection;
use crate::proxy::filters::{RequestFilter, ResponseFilters};
use crate::proxy::resolver::HostResolver;
use crate::proxy::state::ConnectionState;
use crate::proxy::throttle::Throttle;
use crate::proxy::transport::Transport;
use crate::tls::MitmManager;
use rustls::ClientConfig;
use std::sync::Arc;

pub struct ProxyContext {
    pub config: ProxyConfig,
    /// Pseudonym placed in `Via` headers
    pub alias: String,
    pub limits: CodecLimits,
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn HostResolver>,
    pub chained_proxy_manager: Option<Arc<dyn ChainedProxyManager>>,
    pub request_filter: Option<Arc<dyn RequestFilter>>,
    pub response_filters: Option<Arc<dyn ResponseFilters>>,
    pub authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    pub mitm_manager: Option<Arc<dyn MitmManager>>,
    pub activity_trackers: Vec<Arc<dyn ActivityTracker>>,
    /// TLS settings for encrypted chained proxies
    pub upstream_tls: Arc<ClientConfig>,
    /// Bandwidth limit shared by all connections
    pub throttle: Option<Arc<Throttle>>,
}

impl ProxyContext {
    pub fn is_mitm(&self) -> bool {
        self.mitm_manager.is_some()
    }

    /// Notify every tracker, in registration order.
    pub fn track(&self, notify: impl Fn(&dyn ActivityTracker)) {
        for tracker in &self.activity_trackers {
            notify(tracker.as_ref());
        }
    }

    pub fn new_connection(&self, label: String, role: Role, state: ConnectionState) -> Connection {
        let mut connection = Connection::new(
            label,
            role,
            state,
            self.limits,
            self.config.read_buffer_size,
            self.config.write_buffer.clone(),
            self.config.idle_timeout(),
        );
        connection.set_throttle(self.throttle.clone());
        connection
    }
}

/// Context with the default collaborators and no optional ones.
#[cfg(test)]
pub(crate) fn test_context(config: ProxyConfig) -> Arc<ProxyContext> {
    use crate::proxy::resolver::DnsHostResolver;
    use crate::proxy::transport::TcpTransport;

    Arc::new(ProxyContext {
        alias: "test-proxy".to_string(),
        limits: CodecLimits::from_config(&config),
        config,
        transport: Arc::new(TcpTransport::default()),
        resolver: Arc::new(DnsHostResolver),
        chained_proxy_manager: None,
        request_filter: None,
        response_filters: None,
        authenticator: None,
        mitm_manager: None,
        activity_trackers: Vec::new(),
        upstream_tls: crate::tls::create_client_config(&[], true)
            .expect("client config"),
        throttle: None,
    })
}
