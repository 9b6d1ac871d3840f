//! Proxy server bootstrap: listener, collaborators and connection tracking

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::proxy::activity::{ActivityTracker, LoggingActivityTracker};
use crate::proxy::auth::{ProxyAuthenticator, StaticProxyAuthenticator};
use crate::proxy::chain::{ChainedProxyManager, ConfiguredChainedProxies};
use crate::proxy::client::{ClientCommand, ClientConnection};
use crate::proxy::codec::CodecLimits;
use crate::proxy::context::ProxyContext;
use crate::proxy::filters::{RequestFilter, ResponseFilters};
use crate::proxy::proxy_protocol::{read_header, ProxyProtocolHeader};
use crate::proxy::resolver::{DnsHostResolver, HostResolver};
use crate::proxy::throttle::Throttle;
use crate::proxy::transport::{BoxedSocket, Rewind, TcpTransport, Transport};
use crate::tls::{create_client_config, MitmManager, SelfSignedMitmManager};
use crate::{log_debug, log_info};
use rustls::ClientConfig;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Create the listening socket, optionally with SO_REUSEPORT so several
/// processes can share the address.
fn create_reusable_socket(addr: SocketAddr, use_reuseport: bool) -> Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;

    socket.set_reuse_address(true)?;

    if use_reuseport {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            socket.set_reuse_port(true)?;
            info!("SO_REUSEPORT enabled on {}", addr);
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            warn!("SO_REUSEPORT requested but not supported on this platform");
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Running,
    Graceful,
    Abort,
}

/// A forward proxy waiting to be started.
///
/// Collaborators left unset fall back to the ones described by the
/// configuration.
pub struct ProxyServer {
    config: ProxyConfig,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn HostResolver>,
    chained_proxy_manager: Option<Arc<dyn ChainedProxyManager>>,
    request_filter: Option<Arc<dyn RequestFilter>>,
    response_filters: Option<Arc<dyn ResponseFilters>>,
    authenticator: Option<Arc<dyn ProxyAuthenticator>>,
    mitm_manager: Option<Arc<dyn MitmManager>>,
    activity_trackers: Vec<Arc<dyn ActivityTracker>>,
    upstream_tls: Option<Arc<ClientConfig>>,
}

impl ProxyServer {
    pub fn with_config(config: ProxyConfig) -> Self {
        Self {
            transport: Arc::new(TcpTransport::bound_to(config.network_interface)),
            config,
            resolver: Arc::new(DnsHostResolver),
            chained_proxy_manager: None,
            request_filter: None,
            response_filters: None,
            authenticator: None,
            mitm_manager: None,
            activity_trackers: Vec::new(),
            upstream_tls: None,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_chained_proxy_manager(mut self, manager: Arc<dyn ChainedProxyManager>) -> Self {
        self.chained_proxy_manager = Some(manager);
        self
    }

    pub fn with_request_filter(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.request_filter = Some(filter);
        self
    }

    pub fn with_response_filters(mut self, filters: Arc<dyn ResponseFilters>) -> Self {
        self.response_filters = Some(filters);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn ProxyAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_mitm_manager(mut self, manager: Arc<dyn MitmManager>) -> Self {
        self.mitm_manager = Some(manager);
        self
    }

    /// Trackers are notified in the order they were added.
    pub fn with_activity_tracker(mut self, tracker: Arc<dyn ActivityTracker>) -> Self {
        self.activity_trackers.push(tracker);
        self
    }

    /// Limit the bandwidth of all connections together, in bytes per second.
    /// 0 leaves a direction unlimited.
    pub fn with_throttling(mut self, read_bytes_per_second: u64, write_bytes_per_second: u64) -> Self {
        self.config.throttling.read_bytes_per_second = read_bytes_per_second;
        self.config.throttling.write_bytes_per_second = write_bytes_per_second;
        self
    }

    /// TLS settings for chained proxies that require encryption
    pub fn with_upstream_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls = Some(config);
        self
    }

    fn into_context(self) -> Result<Arc<ProxyContext>> {
        let config = self.config;

        let authenticator = match self.authenticator {
            Some(authenticator) => Some(authenticator),
            None => StaticProxyAuthenticator::from_config(&config.authentication)
                .map(|auth| Arc::new(auth) as Arc<dyn ProxyAuthenticator>),
        };
        let chained_proxy_manager = match self.chained_proxy_manager {
            Some(manager) => Some(manager),
            None => ConfiguredChainedProxies::from_config(&config)
                .map(|chain| Arc::new(chain) as Arc<dyn ChainedProxyManager>),
        };
        let mitm_manager = match self.mitm_manager {
            Some(manager) => Some(manager),
            None if config.mitm.enabled => {
                let manager = SelfSignedMitmManager::from_config(&config.mitm)?;
                Some(Arc::new(manager) as Arc<dyn MitmManager>)
            }
            None => None,
        };
        let mut activity_trackers = self.activity_trackers;
        if activity_trackers.is_empty() {
            activity_trackers.push(Arc::new(LoggingActivityTracker::new()));
        }
        let upstream_tls = match self.upstream_tls {
            Some(tls) => tls,
            None => create_client_config(&[], false)?,
        };

        let throttle = Throttle::from_config(&config.throttling).map(|throttle| {
            info!(
                "Throttling reads to {} B/s and writes to {} B/s (0 = unlimited)",
                config.throttling.read_bytes_per_second, config.throttling.write_bytes_per_second
            );
            Arc::new(throttle)
        });

        Ok(Arc::new(ProxyContext {
            alias: config.resolved_alias(),
            limits: CodecLimits::from_config(&config),
            transport: self.transport,
            resolver: self.resolver,
            chained_proxy_manager,
            request_filter: self.request_filter,
            response_filters: self.response_filters,
            authenticator,
            mitm_manager,
            activity_trackers,
            upstream_tls,
            throttle,
            config,
        }))
    }

    /// Bind the listener and start accepting in the background.
    pub async fn start(self) -> Result<RunningProxy> {
        let listen_addr = self.config.bind_addr();
        let use_reuseport = self.config.runtime.use_reuseport;
        let ctx = self.into_context()?;

        let socket = create_reusable_socket(listen_addr, use_reuseport)?;
        let listener = TcpListener::from_std(std::net::TcpListener::from(socket))?;
        let local_addr = listener.local_addr()?;

        info!("Proxy listening on {} (alias {})", local_addr, ctx.alias);
        log_info!(
            "Proxy started: mitm={}, chained={}, authentication={}",
            ctx.is_mitm(),
            ctx.chained_proxy_manager.is_some(),
            ctx.authenticator.is_some()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(Shutdown::Running);
        let acceptor = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        Ok(RunningProxy {
            local_addr,
            shutdown: shutdown_tx,
            acceptor,
        })
    }

    /// Serve until Ctrl-C, then stop gracefully.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("Interrupt received, shutting down");
        running.stop().await;
        Ok(())
    }
}

/// Handle to a started proxy
pub struct RunningProxy {
    local_addr: SocketAddr,
    shutdown: watch::Sender<Shutdown>,
    acceptor: JoinHandle<()>,
}

impl RunningProxy {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, ask every client connection to finish and close,
    /// then abort whatever is left after the grace period.
    pub async fn stop(self) {
        self.finish(Shutdown::Graceful).await;
    }

    /// Stop accepting and drop every connection immediately.
    pub async fn abort(self) {
        self.finish(Shutdown::Abort).await;
    }

    async fn finish(self, mode: Shutdown) {
        // The accept loop only exits through this channel, so a send error
        // means it already finished.
        let _ = self.shutdown.send(mode);
        if let Err(e) = self.acceptor.await {
            if e.is_panic() {
                error!("Accept loop panicked: {}", e);
            }
        }
        info!("Proxy on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    mut shutdown: watch::Receiver<Shutdown>,
) {
    let mut clients = JoinSet::new();
    let mut registry: HashMap<u64, mpsc::UnboundedSender<ClientCommand>> = HashMap::new();
    let mut next_id = 0u64;

    let mode = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break Shutdown::Abort;
                }
                let mode = *shutdown.borrow();
                if mode != Shutdown::Running {
                    break mode;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    registry.retain(|_, tx| !tx.is_closed());
                    next_id += 1;
                    let (tx, rx) = mpsc::unbounded_channel();
                    registry.insert(next_id, tx.clone());
                    clients.spawn(serve_client(Arc::clone(&ctx), stream, peer, tx, rx));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    };
    drop(listener);

    debug!("Stopping with {} open client connections", clients.len());
    if mode == Shutdown::Graceful {
        for tx in registry.values() {
            let _ = tx.send(ClientCommand::Disconnect);
        }
        let drained = tokio::time::timeout(ctx.config.shutdown_grace(), async {
            while clients.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("{} client connections outlived the grace period", clients.len());
        }
    }
    clients.shutdown().await;
}

/// Finish accepting one client: read the PROXY header if configured, then
/// run the client connection until it closes.
async fn serve_client(
    ctx: Arc<ProxyContext>,
    stream: TcpStream,
    peer: SocketAddr,
    handle: mpsc::UnboundedSender<ClientCommand>,
    mailbox: mpsc::UnboundedReceiver<ClientCommand>,
) {
    log_debug!("New connection from: {}", peer);
    let (socket, header, client_addr) = match prepare_client_socket(&ctx, stream, peer).await {
        Ok(prepared) => prepared,
        Err(e) => {
            info!("Dropping connection from {}: {}", peer, e);
            return;
        }
    };
    ClientConnection::new(ctx, socket, client_addr, header, handle, mailbox)
        .run()
        .await;
}

async fn prepare_client_socket(
    ctx: &ProxyContext,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(BoxedSocket, ProxyProtocolHeader, SocketAddr)> {
    stream.set_nodelay(true)?;

    if !ctx.config.proxy_protocol.accept {
        let local = stream.local_addr()?;
        let header = ProxyProtocolHeader::from_addrs(peer, local);
        return Ok((Box::new(stream), header, peer));
    }

    let (header, leftover) =
        tokio::time::timeout(ctx.config.connect_timeout(), read_header(&mut stream)).await??;
    let client_addr = header.source().unwrap_or(peer);
    debug!("PROXY header from {}: client is {}", peer, client_addr);
    let socket: BoxedSocket = Box::new(Rewind::new(stream, leftover));
    Ok((socket, header, client_addr))
}
