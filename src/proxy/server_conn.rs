//! Server-facing connection
//!
//! One actor per destination of a client. It owns the outbound socket, runs
//! the connection flow on the first write, pairs every response with the
//! oldest unanswered request and relays the result to the client actor
//! through its mailbox.

use crate::error::{Error, Result};
use crate::logging::log_connection_error;
use crate::models::{HttpContent, HttpObject, HttpRequest, HttpResponse, Message};
use crate::proxy::chain::ChainedProxy;
use crate::proxy::client::ClientCommand;
use crate::proxy::codec::Role;
use crate::proxy::connection::{Connection, Event, ProxyConnection};
use crate::proxy::context::ProxyContext;
use crate::proxy::filters::ResponseFilter;
use crate::proxy::flow::{ConnectionFlow, FlowStep, OnSuccess, StepRead, TlsTarget};
use crate::proxy::proxy_protocol::ProxyProtocolHeader;
use crate::proxy::state::ConnectionState;
use crate::proxy::transport::{transport_for, Transport};
use crate::utils::{is_switching_protocols, split_host_and_port, strip_host};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace, warn};

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

pub type ServerId = u64;

/// Work the client actor hands to a server-facing connection
#[derive(Debug)]
pub enum ServerCommand {
    /// Send a request head, or a full request. `original` is the client's
    /// unmodified copy, paired with the response later.
    Write {
        request: HttpRequest,
        original: HttpRequest,
    },
    WriteContent(HttpContent),
    WriteRaw(Bytes),
    StopReading,
    ResumeReading,
    Disconnect,
}

/// A request and the head of the response answering it, as received
#[derive(Debug)]
pub struct ResponseContext {
    /// `None` when a response arrived without a matching request
    pub original: Option<HttpRequest>,
    pub response: HttpResponse,
}

struct ServerShared {
    state: Arc<watch::Sender<ConnectionState>>,
    saturated: AtomicBool,
    chained: AtomicBool,
}

/// The client's end of a server-facing connection.
#[derive(Clone)]
pub struct ServerHandle {
    id: ServerId,
    host_and_port: Arc<str>,
    tx: mpsc::UnboundedSender<ServerCommand>,
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn host_and_port(&self) -> &str {
        &self.host_and_port
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_saturated(&self) -> bool {
        self.shared.saturated.load(Ordering::Acquire)
    }

    /// Whether requests still go through a chained proxy
    pub fn is_chained(&self) -> bool {
        self.shared.chained.load(Ordering::Acquire)
    }

    pub fn is_connecting(&self) -> bool {
        self.state().is_part_of_connection_flow()
    }

    /// Returns false once the connection actor is gone.
    pub fn send(&self, command: ServerCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Wait until a running connection flow has finished, one way or the
    /// other. False if `timeout` elapsed first.
    pub async fn wait_for_flow(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        let finished = matches!(
            tokio::time::timeout(
                timeout,
                state.wait_for(|state| !state.is_part_of_connection_flow())
            )
            .await,
            Ok(Ok(_))
        );
        finished
    }
}

/// Start the actor for `host_and_port` on behalf of the client at `client_addr`.
pub fn spawn(
    ctx: Arc<ProxyContext>,
    client: mpsc::UnboundedSender<ClientCommand>,
    client_addr: SocketAddr,
    proxy_protocol: ProxyProtocolHeader,
    host_and_port: String,
    chained_proxy: Option<ChainedProxy>,
) -> ServerHandle {
    let id = NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, mailbox) = mpsc::unbounded_channel();
    let (state, _) = watch::channel(ConnectionState::Disconnected);
    let shared = Arc::new(ServerShared {
        state: Arc::new(state),
        saturated: AtomicBool::new(false),
        chained: AtomicBool::new(chained_proxy.is_some()),
    });

    let mut conn = ctx.new_connection(
        format!("{} -> {}", client_addr, host_and_port),
        Role::Response,
        ConnectionState::Disconnected,
    );
    conn.observe_state(Arc::clone(&shared.state));

    let server = ServerConnection {
        id,
        host_and_port: host_and_port.clone(),
        ctx,
        conn,
        mailbox,
        client,
        client_addr,
        proxy_protocol,
        shared: Arc::clone(&shared),
        chained_proxy,
        issued: VecDeque::new(),
        current: None,
        aggregation: None,
        deferred: VecDeque::new(),
        counted: false,
    };
    tokio::spawn(server.run());

    ServerHandle {
        id,
        host_and_port: host_and_port.into(),
        tx,
        shared,
    }
}

/// A response body being collected for a response filter
struct Aggregation {
    filter: Arc<dyn ResponseFilter>,
    original: HttpRequest,
    head: HttpResponse,
    body: BytesMut,
}

/// Why a connection flow did not complete
enum FlowFailure {
    /// The client asked for a disconnect, or went away
    Cancelled,
    Failed(Error),
}

struct ServerConnection {
    id: ServerId,
    host_and_port: String,
    ctx: Arc<ProxyContext>,
    conn: Connection,
    mailbox: mpsc::UnboundedReceiver<ServerCommand>,
    client: mpsc::UnboundedSender<ClientCommand>,
    client_addr: SocketAddr,
    proxy_protocol: ProxyProtocolHeader,
    shared: Arc<ServerShared>,
    chained_proxy: Option<ChainedProxy>,
    /// Originals of requests written but not yet answered, oldest first
    issued: VecDeque<HttpRequest>,
    /// Response whose body is being relayed
    current: Option<Arc<ResponseContext>>,
    aggregation: Option<Aggregation>,
    /// Commands that arrived while a flow was running
    deferred: VecDeque<ServerCommand>,
    /// Whether the client counts this connection as connected
    counted: bool,
}

impl ServerConnection {
    async fn run(mut self) {
        trace!("{}: server connection started", self.conn.label());
        loop {
            if let Some(command) = self.deferred.pop_front() {
                self.handle_command(command).await;
                continue;
            }

            match self.conn.next_event(Some(&mut self.mailbox)).await {
                Event::Command(command) => self.handle_command(command).await,
                Event::MailboxClosed => break,
                Event::Message(message) => self.read(message).await,
                Event::Malformed(e) => {
                    warn!("{}: unparseable response: {}", self.conn.label(), e);
                    self.disconnect().await;
                }
                Event::Saturated => {
                    self.shared.saturated.store(true, Ordering::Release);
                    self.notify_client(ClientCommand::ServerSaturated(self.id));
                }
                Event::Writable => {
                    self.shared.saturated.store(false, Ordering::Release);
                    self.notify_client(ClientCommand::ServerWritable(self.id));
                }
                Event::MessageFlushed => {}
                Event::IdleTimeout => self.timed_out().await,
                Event::Closed(error) => {
                    if let Some(e) = &error {
                        log_connection_error(self.conn.label(), e);
                    }
                    self.on_disconnected();
                }
            }
            self.report_io();
        }

        self.disconnect().await;
        trace!("{}: server connection finished", self.conn.label());
    }

    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Write { request, original } => {
                if self.conn.is_connected() {
                    self.write_request(request, original);
                } else {
                    self.connect_and_write(request, original).await;
                }
            }
            ServerCommand::WriteContent(content) => {
                if self.conn.is_connected() {
                    self.conn.write(HttpObject::Content(content));
                } else {
                    debug!("{}: dropping body chunk, not connected", self.conn.label());
                }
            }
            ServerCommand::WriteRaw(buf) => {
                if self.conn.is_connected() {
                    self.conn.write(Message::Raw(buf));
                } else {
                    debug!("{}: dropping {} tunnel bytes, not connected", self.conn.label(), buf.len());
                }
            }
            ServerCommand::StopReading => self.conn.stop_reading(),
            ServerCommand::ResumeReading => self.conn.resume_reading(),
            ServerCommand::Disconnect => self.disconnect().await,
        }
    }

    fn write_request(&mut self, request: HttpRequest, original: HttpRequest) {
        self.ctx.track(|tracker| {
            tracker.request_sent_to_server(self.client_addr, &self.host_and_port, &request)
        });
        self.issued.push_back(original);
        self.conn.write(HttpObject::Request(request));
    }

    /// Run the connection flow, falling back from a failing chained proxy to
    /// a direct connection once, then write `request` unless the flow took
    /// it over.
    async fn connect_and_write(&mut self, mut request: HttpRequest, original: HttpRequest) {
        self.notify_client(ClientCommand::ServerFlowStarted(self.id));

        loop {
            match self.run_flow(&request).await {
                Ok(suppress_initial_request) => {
                    self.conn.become_state(ConnectionState::AwaitingInitial);
                    self.counted = true;
                    debug!("{}: connected", self.conn.label());
                    self.notify_client(ClientCommand::ServerConnected {
                        server: self.id,
                        forward_initial_request: !suppress_initial_request,
                    });
                    if !suppress_initial_request {
                        self.write_request(request, original);
                    }
                    return;
                }
                Err(FlowFailure::Failed(e)) if self.chained_proxy.is_some() => {
                    self.conn.disconnected();
                    let Some(proxy) = self.chained_proxy.take() else {
                        continue;
                    };
                    warn!(
                        "{}: chained proxy {} failed: {}; connecting directly",
                        self.conn.label(),
                        proxy.address,
                        e
                    );
                    if let Some(manager) = &self.ctx.chained_proxy_manager {
                        manager.on_communication_error(&proxy.address);
                    }
                    self.shared.chained.store(false, Ordering::Release);
                    if !request.is_connect() {
                        request.uri = strip_host(&request.uri);
                    }
                }
                Err(failure) => {
                    self.conn.disconnected();
                    match failure {
                        FlowFailure::Cancelled => {
                            debug!("{}: connection flow cancelled", self.conn.label())
                        }
                        FlowFailure::Failed(e) => {
                            info!("{}: unable to connect: {}", self.conn.label(), e)
                        }
                    }
                    self.notify_client(ClientCommand::ServerConnectionFailed {
                        server: self.id,
                        initial_request: original,
                    });
                    return;
                }
            }
        }
    }

    async fn run_flow(&mut self, request: &HttpRequest) -> std::result::Result<bool, FlowFailure> {
        let default_port = if request.is_connect() { 443 } else { 80 };
        let (host, port) = split_host_and_port(&self.host_and_port, default_port)
            .ok_or_else(|| FlowFailure::Failed(Error::Resolution(self.host_and_port.clone())))?;

        let mut flow = ConnectionFlow::for_request(
            request,
            self.chained_proxy.as_ref(),
            self.ctx.is_mitm(),
            &host,
            port,
        );

        while let Some(step) = flow.advance() {
            debug!("{}: {} ({})", self.conn.label(), step, step.state());
            self.conn.become_state(step.state());

            if step.runs_on_client() {
                let timeout = self.ctx.config.flow_wait_timeout();
                guarded(
                    &mut self.mailbox,
                    &mut self.deferred,
                    run_on_client(&self.client, step.clone(), timeout),
                )
                .await?;
            } else {
                guarded(
                    &mut self.mailbox,
                    &mut self.deferred,
                    execute_step(
                        &mut self.conn,
                        &self.ctx,
                        self.chained_proxy.as_ref(),
                        &step,
                        request,
                        (host.as_str(), port),
                        self.proxy_protocol,
                    ),
                )
                .await?;
            }

            if step.on_success() == OnSuccess::AwaitRead {
                let timeout = self.ctx.config.connect_timeout();
                guarded(
                    &mut self.mailbox,
                    &mut self.deferred,
                    await_step_read(&mut self.conn, &step, timeout),
                )
                .await?;
            }
        }

        Ok(flow.suppress_initial_request())
    }

    async fn timed_out(&mut self) {
        if !self.conn.is_connected() {
            return;
        }
        if !self.issued.is_empty() || self.current.is_some() {
            info!("{}: timed out waiting for a response", self.conn.label());
            self.notify_client(ClientCommand::ServerTimedOut(self.id));
        } else {
            debug!("{}: idle, disconnecting", self.conn.label());
        }
        self.disconnect().await;
    }

    async fn disconnect(&mut self) {
        self.conn.disconnect().await;
        self.on_disconnected();
    }

    fn on_disconnected(&mut self) {
        let unanswered = self.issued.len()
            + usize::from(self.current.is_some() || self.aggregation.is_some());
        self.conn.disconnected();
        self.shared.saturated.store(false, Ordering::Release);
        self.issued.clear();
        self.current = None;
        self.aggregation = None;

        if std::mem::take(&mut self.counted) {
            self.notify_client(ClientCommand::ServerDisconnected {
                server: self.id,
                unanswered,
            });
        }
    }

    fn notify_client(&self, command: ClientCommand) {
        if self.client.send(command).is_err() {
            trace!("{}: client connection is gone", self.conn.label());
        }
    }

    fn relay(&self, context: Arc<ResponseContext>, object: HttpObject) {
        self.notify_client(ClientCommand::Respond {
            server: self.id,
            context,
            object,
        });
    }

    fn report_io(&mut self) {
        let (read, written) = self.conn.take_io_counters();
        if read > 0 {
            self.ctx.track(|tracker| {
                tracker.bytes_received_from_server(self.client_addr, &self.host_and_port, read)
            });
        }
        if written > 0 {
            self.ctx.track(|tracker| {
                tracker.bytes_sent_to_server(self.client_addr, &self.host_and_port, written)
            });
        }
    }

    /// Filter for a final response to `original`, if one is configured for
    /// this destination.
    fn response_filter(
        &self,
        response: &HttpResponse,
        original: Option<&HttpRequest>,
    ) -> Option<(Arc<dyn ResponseFilter>, HttpRequest)> {
        if response.status.is_informational() {
            return None;
        }
        let filter = self
            .ctx
            .response_filters
            .as_ref()?
            .get_filter(&self.host_and_port)?;
        Some((filter, original?.clone()))
    }

    async fn aggregate(&mut self, content: HttpContent) {
        let Some(aggregation) = self.aggregation.as_mut() else {
            return;
        };
        aggregation.body.extend_from_slice(&content.data);

        if aggregation.body.len() > aggregation.filter.max_response_size() {
            warn!(
                "{}: response exceeds {} bytes, not filtering it",
                self.conn.label(),
                aggregation.filter.max_response_size()
            );
            let original = aggregation.original.clone();
            self.aggregation = None;
            self.notify_client(ClientCommand::ResponseTooLarge {
                server: self.id,
                original,
            });
            self.disconnect().await;
            return;
        }
        if !content.last {
            return;
        }

        let Some(Aggregation {
            filter,
            original,
            mut head,
            body,
        }) = self.aggregation.take()
        else {
            return;
        };
        head.headers.remove(TRANSFER_ENCODING);
        head.body = Some(body.freeze());
        filter.filter_response(&original, &mut head);
        let length = head.body.as_ref().map_or(0, Bytes::len);
        head.headers.insert(CONTENT_LENGTH, HeaderValue::from(length));

        let context = Arc::new(ResponseContext {
            original: Some(original),
            response: head.head_only(),
        });
        self.relay(context, HttpObject::Response(head));
    }
}

#[async_trait]
impl ProxyConnection for ServerConnection {
    fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    async fn read_initial(&mut self, object: HttpObject) -> ConnectionState {
        let HttpObject::Response(response) = object else {
            debug!("{}: expected a response, got {:?}", self.conn.label(), object);
            return ConnectionState::AwaitingInitial;
        };
        self.ctx.track(|tracker| {
            tracker.response_received_from_server(self.client_addr, &self.host_and_port, &response)
        });

        let switching = is_switching_protocols(&response);
        // Interim responses answer nothing yet
        let original = if response.status.is_informational() && !switching {
            self.issued.front().cloned()
        } else {
            let original = self.issued.pop_front();
            if original.is_none() {
                debug!(
                    "{}: {} arrived with no request waiting for it",
                    self.conn.label(),
                    response
                );
            }
            original
        };
        let last = response.body.is_some();

        if let Some((filter, request)) = self.response_filter(&response, original.as_ref()) {
            let body = response.body.clone();
            self.aggregation = Some(Aggregation {
                filter,
                original: request,
                head: response.head_only(),
                body: BytesMut::new(),
            });
            return match body {
                Some(body) => {
                    self.aggregate(HttpContent::last(body)).await;
                    ConnectionState::AwaitingInitial
                }
                None => ConnectionState::AwaitingChunk,
            };
        }

        let context = Arc::new(ResponseContext {
            original,
            response: response.head_only(),
        });
        self.current = (!last).then(|| Arc::clone(&context));
        self.relay(context, HttpObject::Response(response));

        if switching {
            self.conn.start_tunneling();
        }
        if last {
            ConnectionState::AwaitingInitial
        } else {
            ConnectionState::AwaitingChunk
        }
    }

    async fn read_chunk(&mut self, object: HttpObject) {
        let HttpObject::Content(content) = object else {
            return;
        };
        if self.aggregation.is_some() {
            self.aggregate(content).await;
            return;
        }

        let last = content.last;
        match &self.current {
            Some(context) => self.relay(Arc::clone(context), HttpObject::Content(content)),
            None => debug!("{}: dropping chunk without a response", self.conn.label()),
        }
        if last {
            self.current = None;
        }
    }

    async fn read_raw(&mut self, buf: Bytes) {
        self.notify_client(ClientCommand::RespondRaw(buf));
    }
}

/// Drive one flow step while watching the mailbox: a disconnect request
/// cancels the flow, anything else waits until the flow is over.
async fn guarded<F>(
    mailbox: &mut mpsc::UnboundedReceiver<ServerCommand>,
    deferred: &mut VecDeque<ServerCommand>,
    step: F,
) -> std::result::Result<(), FlowFailure>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(step);
    loop {
        tokio::select! {
            biased;
            result = &mut step => return result.map_err(FlowFailure::Failed),
            command = mailbox.recv() => match command {
                Some(ServerCommand::Disconnect) | None => return Err(FlowFailure::Cancelled),
                Some(command) => deferred.push_back(command),
            },
        }
    }
}

async fn run_on_client(
    client: &mpsc::UnboundedSender<ClientCommand>,
    step: FlowStep,
    timeout: Duration,
) -> Result<()> {
    let (done, result) = oneshot::channel();
    client
        .send(ClientCommand::RunFlowStep { step, done })
        .map_err(|_| Error::Closed("client connection is gone".to_string()))?;
    tokio::time::timeout(timeout, result)
        .await?
        .map_err(|_| Error::Closed("client connection dropped the flow step".to_string()))?
}

async fn execute_step(
    conn: &mut Connection,
    ctx: &ProxyContext,
    chained_proxy: Option<&ChainedProxy>,
    step: &FlowStep,
    request: &HttpRequest,
    (host, port): (&str, u16),
    proxy_protocol: ProxyProtocolHeader,
) -> Result<()> {
    match step {
        FlowStep::ConnectChannel => {
            let chained_transport;
            let (target_host, target_port, transport): (String, u16, &dyn Transport) =
                match chained_proxy {
                    Some(proxy) => {
                        let (proxy_host, proxy_port) = proxy
                            .host_and_port()
                            .ok_or_else(|| Error::Resolution(proxy.address.clone()))?;
                        // The server's transport carries the local interface
                        // binding and any custom connector
                        let transport: &dyn Transport = match proxy.transport.as_str() {
                            "" | "tcp" => &*ctx.transport,
                            name if name == ctx.transport.name() => &*ctx.transport,
                            name => {
                                chained_transport = transport_for(name)?;
                                &*chained_transport
                            }
                        };
                        (proxy_host, proxy_port, transport)
                    }
                    None => (host.to_string(), port, &*ctx.transport),
                };

            let addr = ctx.resolver.resolve(&target_host, target_port).await?;
            debug!("{}: connecting to {} over {}", conn.label(), addr, transport.name());
            let socket = transport.connect(addr, ctx.config.connect_timeout()).await?;
            conn.attach(socket);
            if ctx.config.proxy_protocol.send {
                conn.write(Message::Raw(proxy_protocol.encode()));
            }
            Ok(())
        }
        FlowStep::EncryptChannel(TlsTarget::ChainedProxy { server_name }) => {
            let name = rustls::ServerName::try_from(server_name.as_str())
                .map_err(|_| Error::Certificate(format!("invalid server name {:?}", server_name)))?;
            conn.encrypt_as_client(TlsConnector::from(Arc::clone(&ctx.upstream_tls)), name)
                .await
        }
        FlowStep::EncryptChannel(TlsTarget::Origin { host, port }) => {
            let manager = ctx
                .mitm_manager
                .as_ref()
                .ok_or_else(|| Error::Config("TLS interception is not configured".to_string()))?;
            let (connector, name) = manager.new_client_engine(host, *port)?;
            conn.encrypt_as_client(connector, name).await
        }
        FlowStep::ConnectWithChainedProxy => {
            conn.write(HttpObject::Request(request.clone()));
            conn.flush().await
        }
        FlowStep::StartTunneling => {
            conn.start_tunneling();
            Ok(())
        }
        step => Err(Error::Config(format!("{} runs on the client connection", step))),
    }
}

/// Feed inbound messages to a paused step until it advances or fails.
async fn await_step_read(conn: &mut Connection, step: &FlowStep, timeout: Duration) -> Result<()> {
    let read = async {
        loop {
            match conn.next_event::<()>(None).await {
                Event::Message(message) => match step.read(&message) {
                    StepRead::Continue => trace!("{}: {} still waiting", conn.label(), step),
                    StepRead::Advance => return Ok(()),
                    StepRead::Fail(e) => return Err(e),
                },
                Event::Malformed(e) => return Err(e),
                Event::Closed(e) => {
                    return Err(e.unwrap_or_else(|| {
                        Error::Closed(format!("{} closed during {}", conn.label(), step))
                    }))
                }
                Event::IdleTimeout => {
                    return Err(Error::Closed(format!("{} went idle during {}", conn.label(), step)))
                }
                _ => {}
            }
        }
    };
    tokio::time::timeout(timeout, read).await?
}
