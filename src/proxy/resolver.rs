//! Upstream address resolution

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use tracing::debug;

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr>;
}

/// System resolver through `tokio::net::lookup_host`
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsHostResolver;

#[async_trait]
impl HostResolver for DnsHostResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let target = format!("{}:{}", host, port);
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                debug!("Could not resolve {}: {}", target, e);
                Error::Resolution(target.clone())
            })?;
        addrs.next().ok_or(Error::Resolution(target))
    }
}
