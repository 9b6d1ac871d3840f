//! Forward proxy core: connections, flows and the server bootstrap

pub mod activity;
pub mod auth;
pub mod chain;
pub mod client;
pub mod codec;
pub mod connection;
pub mod context;
pub mod filters;
pub mod flow;
pub mod proxy_protocol;
pub mod resolver;
pub mod server;
pub mod server_conn;
pub mod state;
pub mod throttle;
pub mod transport;

// Re-exports
pub use activity::{ActivityTracker, LoggingActivityTracker, NoopActivityTracker};
pub use auth::{ProxyAuthenticator, StaticProxyAuthenticator};
pub use chain::{ChainedProxy, ChainedProxyManager, ConfiguredChainedProxies};
pub use filters::{RequestFilter, ResponseFilter, ResponseFilterMap, ResponseFilters};
pub use resolver::{DnsHostResolver, HostResolver};
pub use server::{ProxyServer, RunningProxy};
pub use state::ConnectionState;
pub use throttle::{Throttle, TokenBucket};
pub use transport::{TcpTransport, Transport};
