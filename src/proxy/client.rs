//! Client-facing connection
//!
//! One actor per accepted socket. It parses requests, authenticates and
//! rewrites them, hands them to the server-facing connection for their
//! destination and writes whatever those connections relay back. It owns the
//! `host:port -> server` table exclusively; everything the server-facing
//! connections need from it arrives as a [`ClientCommand`].

use crate::error::{Error, Result};
use crate::logging::log_connection_error;
use crate::models::{HttpObject, HttpRequest, HttpResponse, Message};
use crate::proxy::auth::basic_credentials;
use crate::proxy::codec::Role;
use crate::proxy::connection::{Connection, Event, ProxyConnection};
use crate::proxy::context::ProxyContext;
use crate::proxy::flow::FlowStep;
use crate::proxy::proxy_protocol::ProxyProtocolHeader;
use crate::proxy::server_conn::{self, ResponseContext, ServerCommand, ServerHandle, ServerId};
use crate::proxy::state::ConnectionState;
use crate::proxy::transport::BoxedSocket;
use crate::utils::{
    add_via, http_date_now, identify_host_and_port, is_absolute_uri, is_last_chunk,
    is_request_keep_alive, is_response_keep_alive, is_response_self_terminating,
    is_switching_protocols, is_transfer_encoding_chunked, remove_sdch_encoding, set_keep_alive,
    set_transfer_encoding_chunked, strip_connection_tokens, strip_hop_by_hop_headers, strip_host,
    switch_proxy_connection_header, PROXY_CONNECTION,
};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, DATE, PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION, TRANSFER_ENCODING,
};
use http::{StatusCode, Version};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

const AUTHENTICATION_REQUIRED_BODY: &str = "<!DOCTYPE HTML \"-//IETF//DTD HTML 2.0//EN\">\n\
<html><head>\n\
<title>407 Proxy Authentication Required</title>\n\
</head><body>\n\
<h1>Proxy Authentication Required</h1>\n\
<p>This server could not verify that you\n\
are authorized to access the document\n\
requested.  Either you supplied the wrong\n\
credentials (e.g., bad password), or your\n\
browser doesn't understand how to supply\n\
the credentials required.</p>\n\
</body></html>\n";

/// Messages for the client actor, mostly from its server-facing connections
#[derive(Debug)]
pub enum ClientCommand {
    /// Relay a response head, body piece or full response
    Respond {
        server: ServerId,
        context: Arc<ResponseContext>,
        object: HttpObject,
    },
    /// Relay tunnel bytes
    RespondRaw(Bytes),
    /// Run a flow step that acts on the client socket
    RunFlowStep {
        step: FlowStep,
        done: oneshot::Sender<Result<()>>,
    },
    ServerFlowStarted(ServerId),
    ServerConnected {
        server: ServerId,
        forward_initial_request: bool,
    },
    ServerConnectionFailed {
        server: ServerId,
        initial_request: HttpRequest,
    },
    ServerSaturated(ServerId),
    ServerWritable(ServerId),
    /// The server went idle while a response was outstanding
    ServerTimedOut(ServerId),
    /// A filtered response outgrew the filter's buffer
    ResponseTooLarge {
        server: ServerId,
        original: HttpRequest,
    },
    ServerDisconnected {
        server: ServerId,
        /// Requests that will never be answered
        unanswered: usize,
    },
    /// Close gracefully
    Disconnect,
}

pub struct ClientConnection {
    conn: Connection,
    ctx: Arc<ProxyContext>,
    client_addr: SocketAddr,
    proxy_protocol: ProxyProtocolHeader,
    mailbox: mpsc::UnboundedReceiver<ClientCommand>,
    handle: mpsc::UnboundedSender<ClientCommand>,
    servers: HashMap<ServerId, ServerHandle>,
    servers_by_host: HashMap<String, ServerId>,
    current_server: Option<ServerHandle>,
    /// Head of the request being served, for short-circuit responses
    current_request: Option<HttpRequest>,
    connecting_servers: usize,
    connected_servers: usize,
    pending_responses: usize,
    authenticated: bool,
    mitming: bool,
}

impl ClientConnection {
    pub fn new(
        ctx: Arc<ProxyContext>,
        socket: BoxedSocket,
        client_addr: SocketAddr,
        proxy_protocol: ProxyProtocolHeader,
        handle: mpsc::UnboundedSender<ClientCommand>,
        mailbox: mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Self {
        let mut conn = ctx.new_connection(
            client_addr.to_string(),
            Role::Request,
            ConnectionState::AwaitingInitial,
        );
        conn.attach(socket);

        Self {
            conn,
            ctx,
            client_addr,
            proxy_protocol,
            mailbox,
            handle,
            servers: HashMap::new(),
            servers_by_host: HashMap::new(),
            current_server: None,
            current_request: None,
            connecting_servers: 0,
            connected_servers: 0,
            pending_responses: 0,
            authenticated: false,
            mitming: false,
        }
    }

    pub async fn run(mut self) {
        debug!("{}: client connected", self.conn.label());
        self.ctx.track(|tracker| tracker.client_connected(self.client_addr));

        loop {
            match self.conn.next_event(Some(&mut self.mailbox)).await {
                Event::Command(command) => self.handle_command(command).await,
                Event::MailboxClosed => break,
                Event::Message(message) => self.read(message).await,
                Event::Malformed(e) => {
                    info!("{}: malformed request: {}", self.conn.label(), e);
                    self.write_unparseable_request();
                }
                Event::Saturated => self.became_saturated(),
                Event::Writable => self.became_writable(),
                Event::MessageFlushed => {
                    self.ctx.track(|tracker| tracker.response_sent_to_client(self.client_addr))
                }
                Event::IdleTimeout => {
                    if self.pending_responses == 0 {
                        debug!("{}: idle, disconnecting", self.conn.label());
                        self.conn.become_state(ConnectionState::DisconnectRequested);
                    }
                }
                Event::Closed(error) => {
                    if let Some(e) = &error {
                        log_connection_error(self.conn.label(), e);
                    }
                    self.conn.disconnected();
                }
            }
            self.report_io();

            match self.conn.state() {
                ConnectionState::DisconnectRequested => {
                    self.conn.disconnect().await;
                    self.report_io();
                    break;
                }
                ConnectionState::Disconnected => break,
                _ => {}
            }
        }

        for server in self.servers.values() {
            server.send(ServerCommand::Disconnect);
        }
        self.ctx.track(|tracker| tracker.client_disconnected(self.client_addr));
        debug!("{}: client disconnected", self.conn.label());
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Respond {
                server,
                context,
                object,
            } => self.respond(server, &context, object),
            ClientCommand::RespondRaw(buf) => self.conn.write(Message::Raw(buf)),
            ClientCommand::RunFlowStep { step, done } => {
                let result = self.run_flow_step(step).await;
                if done.send(result).is_err() {
                    trace!("{}: flow step result nobody waits for", self.conn.label());
                }
            }
            ClientCommand::ServerFlowStarted(_) => {
                self.connecting_servers += 1;
                self.conn.stop_reading();
            }
            ClientCommand::ServerConnected {
                server,
                forward_initial_request,
            } => {
                debug!("{}: server {} connected", self.conn.label(), server);
                self.connected_servers += 1;
                if !forward_initial_request {
                    self.conn.become_state(ConnectionState::AwaitingInitial);
                }
                self.server_flow_finished();
            }
            ClientCommand::ServerConnectionFailed {
                server,
                initial_request,
            } => {
                debug!("{}: server {} failed to connect", self.conn.label(), server);
                self.server_flow_finished();
                if !initial_request.is_connect() {
                    self.pending_responses = self.pending_responses.saturating_sub(1);
                }
                if !self.conn.state().is_disconnecting_or_disconnected() {
                    let next = self.write_bad_gateway(&initial_request);
                    self.conn.become_state(next);
                }
            }
            ClientCommand::ServerSaturated(server) => {
                if self.servers.contains_key(&server) {
                    debug!("{}: server {} saturated, pausing client", self.conn.label(), server);
                    self.conn.stop_reading();
                }
            }
            ClientCommand::ServerWritable(_) => self.resume_reading_if_possible(),
            ClientCommand::ServerTimedOut(server) => {
                let is_current = self.current_server.as_ref().map(ServerHandle::id) == Some(server);
                if is_current && self.pending_responses > 0 {
                    let request = self.current_request.clone();
                    let next = self.write_gateway_timeout(request.as_ref());
                    self.conn.become_state(next);
                }
            }
            ClientCommand::ResponseTooLarge { original, .. } => {
                let next = self.write_bad_gateway(&original);
                self.conn.become_state(next);
            }
            ClientCommand::ServerDisconnected { server, unanswered } => {
                self.connected_servers = self.connected_servers.saturating_sub(1);
                self.pending_responses = self.pending_responses.saturating_sub(unanswered);
                debug!(
                    "{}: server {} disconnected, {} still connected",
                    self.conn.label(),
                    server,
                    self.connected_servers
                );
                if self.connected_servers == 0 {
                    self.conn.become_state(ConnectionState::DisconnectRequested);
                }
            }
            ClientCommand::Disconnect => {
                self.conn.become_state(ConnectionState::DisconnectRequested)
            }
        }
    }

    fn server_flow_finished(&mut self) {
        self.connecting_servers = self.connecting_servers.saturating_sub(1);
        if self.connecting_servers == 0 {
            self.resume_reading_if_possible();
        }
    }

    fn resume_reading_if_possible(&mut self) {
        if self.connecting_servers > 0 {
            return;
        }
        if self.servers.values().any(ServerHandle::is_saturated) {
            return;
        }
        self.conn.resume_reading();
    }

    /// Our outbound buffer is full: stop every server feeding it.
    fn became_saturated(&mut self) {
        debug!("{}: saturated, pausing servers", self.conn.label());
        for server in self.servers.values() {
            server.send(ServerCommand::StopReading);
        }
    }

    fn became_writable(&mut self) {
        debug!("{}: writable, resuming servers", self.conn.label());
        for server in self.servers.values() {
            if !server.is_saturated() {
                server.send(ServerCommand::ResumeReading);
            }
        }
    }

    fn report_io(&mut self) {
        let (read, written) = self.conn.take_io_counters();
        if read > 0 {
            self.ctx
                .track(|tracker| tracker.bytes_received_from_client(self.client_addr, read));
        }
        if written > 0 {
            self.ctx
                .track(|tracker| tracker.bytes_sent_to_client(self.client_addr, written));
        }
    }

    async fn run_flow_step(&mut self, step: FlowStep) -> Result<()> {
        match step {
            FlowStep::RespondConnectSuccessful => {
                let mut response = HttpResponse::new(Version::HTTP_11, StatusCode::OK)
                    .with_reason("Connection established");
                response
                    .headers
                    .insert(CONNECTION, HeaderValue::from_static("Keep-Alive"));
                response
                    .headers
                    .insert(PROXY_CONNECTION, HeaderValue::from_static("Keep-Alive"));
                add_via(&mut response.headers, Version::HTTP_11, &self.ctx.alias);
                response.body = Some(Bytes::new());
                self.conn.write(HttpObject::Response(response));
                self.conn.flush().await
            }
            FlowStep::ClientStartTunneling => {
                self.conn.start_tunneling();
                Ok(())
            }
            FlowStep::MitmEncryptClientChannel { host } => {
                let manager = self.ctx.mitm_manager.clone().ok_or_else(|| {
                    Error::Config("TLS interception is not configured".to_string())
                })?;
                let acceptor = manager.new_server_engine(&host)?;
                self.conn.encrypt_as_server(acceptor).await?;
                self.mitming = true;
                debug!("{}: intercepting TLS for {}", self.conn.label(), host);
                Ok(())
            }
            step => Err(Error::Config(format!("{} runs on the server connection", step))),
        }
    }

    /// Relay what a server connection sent, then apply the close rules once
    /// the response is complete.
    fn respond(&mut self, server: ServerId, context: &ResponseContext, object: HttpObject) {
        let Some(server) = self.servers.get(&server).cloned() else {
            debug!("{}: response from unknown server {}", self.conn.label(), server);
            return;
        };
        let original = context.original.as_ref();

        let object = match object {
            HttpObject::Response(mut response) => {
                let is_head = original.map_or(false, HttpRequest::is_head);
                if response.body.is_none()
                    && !is_head
                    && !is_switching_protocols(&response)
                    && !is_response_self_terminating(&response)
                {
                    set_transfer_encoding_chunked(&mut response.headers);
                }
                if response.version == Version::HTTP_10
                    && is_transfer_encoding_chunked(&response.headers)
                {
                    response.version = Version::HTTP_11;
                }
                self.modify_response_headers(&mut response);
                HttpObject::Response(response)
            }
            other => other,
        };

        let last = is_last_chunk(&object);
        self.conn.write(object);

        let status = context.response.status;
        if is_switching_protocols(&context.response) {
            debug!("{}: switching protocols with {}", self.conn.label(), server.host_and_port());
            self.conn.start_tunneling();
            return;
        }
        if !last || status.is_informational() {
            return;
        }

        self.pending_responses = self.pending_responses.saturating_sub(1);
        if !is_response_keep_alive(&context.response) {
            debug!("{}: closing {} after the response", self.conn.label(), server.host_and_port());
            server.send(ServerCommand::Disconnect);
        }
        if !original.map_or(true, is_request_keep_alive) {
            debug!("{}: request was not keep-alive, closing", self.conn.label());
            self.conn.become_state(ConnectionState::DisconnectRequested);
        }
    }

    fn modify_response_headers(&self, response: &mut HttpResponse) {
        if self.ctx.config.transparent {
            return;
        }
        strip_connection_tokens(&mut response.headers);
        strip_hop_by_hop_headers(&mut response.headers);
        add_via(&mut response.headers, response.version, &self.ctx.alias);
        if !response.headers.contains_key(DATE) {
            if let Ok(date) = HeaderValue::from_str(&http_date_now()) {
                response.headers.insert(DATE, date);
            }
        }
    }

    fn rewrite_request(&self, request: &mut HttpRequest, chained: bool) {
        // A chained proxy needs the absolute form, except inside intercepted tunnels
        if !request.is_connect() && !(chained && !self.mitming) {
            request.uri = strip_host(&request.uri);
        }
        if self.ctx.config.transparent {
            return;
        }
        remove_sdch_encoding(&mut request.headers);
        switch_proxy_connection_header(&mut request.headers);
        strip_connection_tokens(&mut request.headers);
        strip_hop_by_hop_headers(&mut request.headers);
        add_via(&mut request.headers, request.version, &self.ctx.alias);
    }

    /// Check credentials once per connection. Writes the 407 challenge and
    /// returns true when the request may not proceed.
    fn authentication_required(&mut self, request: &mut HttpRequest) -> bool {
        let Some(authenticator) = self.ctx.authenticator.clone() else {
            return false;
        };
        if self.authenticated {
            return false;
        }

        match basic_credentials(&request.headers) {
            Some((username, password)) if authenticator.authenticate(&username, &password) => {
                debug!("{}: proxy authorization accepted for {}", self.conn.label(), username);
                request.headers.remove(PROXY_AUTHORIZATION);
                self.authenticated = true;
                false
            }
            credentials => {
                if credentials.is_some() {
                    info!("{}: rejected proxy credentials", self.conn.label());
                }
                self.write_authentication_required(authenticator.realm(), request);
                true
            }
        }
    }

    fn write_authentication_required(&mut self, realm: &str, request: &HttpRequest) {
        let mut response = HttpResponse::full(
            Version::HTTP_11,
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            AUTHENTICATION_REQUIRED_BODY,
        );
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=UTF-8"));
        if let Ok(date) = HeaderValue::from_str(&http_date_now()) {
            response.headers.insert(DATE, date);
        }
        let challenge = format!("Basic realm=\"{}\"", realm);
        match HeaderValue::from_str(&challenge) {
            Ok(value) => {
                response.headers.insert(PROXY_AUTHENTICATE, value);
            }
            Err(_) => {
                response
                    .headers
                    .insert(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic"));
            }
        }
        if request.is_head() {
            response.body = Some(Bytes::new());
        }
        // Written as is: the challenge headers are hop-by-hop
        self.conn.write(HttpObject::Response(response));
    }

    fn write_bad_request(&mut self, request: &HttpRequest) -> ConnectionState {
        let body = format!("Bad Request to URI: {}", request.uri);
        let response = HttpResponse::full(Version::HTTP_11, StatusCode::BAD_REQUEST, body);
        self.respond_with_short_circuit(Some(request), response)
    }

    fn write_unparseable_request(&mut self) {
        let mut response = HttpResponse::full(
            Version::HTTP_11,
            StatusCode::BAD_REQUEST,
            "Unable to parse HTTP request",
        );
        set_keep_alive(response.version, &mut response.headers, false);
        let next = self.respond_with_short_circuit(None, response);
        self.conn.become_state(next);
    }

    fn write_bad_gateway(&mut self, request: &HttpRequest) -> ConnectionState {
        let body = format!("Bad Gateway: {}", request.uri);
        let mut response = HttpResponse::full(Version::HTTP_11, StatusCode::BAD_GATEWAY, body);
        set_keep_alive(response.version, &mut response.headers, false);
        self.respond_with_short_circuit(Some(request), response)
    }

    fn write_gateway_timeout(&mut self, request: Option<&HttpRequest>) -> ConnectionState {
        let mut response =
            HttpResponse::full(Version::HTTP_11, StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout");
        set_keep_alive(response.version, &mut response.headers, false);
        self.respond_with_short_circuit(request, response)
    }

    /// Answer the client directly. Returns the state to move to: the
    /// connection closes unless both the request and the response are
    /// keep-alive.
    fn respond_with_short_circuit(
        &mut self,
        request: Option<&HttpRequest>,
        mut response: HttpResponse,
    ) -> ConnectionState {
        if request.map_or(false, HttpRequest::is_head) {
            response.body = Some(Bytes::new());
        }
        if response.body.is_none() {
            response.body = Some(Bytes::new());
            if !response.headers.contains_key(TRANSFER_ENCODING)
                && !response.headers.contains_key(CONTENT_LENGTH)
            {
                response.headers.insert(CONTENT_LENGTH, HeaderValue::from(0));
            }
        }

        let keep_alive =
            is_response_keep_alive(&response) && request.map_or(true, is_request_keep_alive);
        if response.status != StatusCode::BAD_GATEWAY
            && response.status != StatusCode::GATEWAY_TIMEOUT
        {
            self.modify_response_headers(&mut response);
        }
        set_keep_alive(response.version, &mut response.headers, keep_alive);

        debug!("{}: short-circuit {}", self.conn.label(), response);
        self.conn.write(HttpObject::Response(response));
        self.current_request = None;

        if keep_alive {
            ConnectionState::AwaitingInitial
        } else {
            ConnectionState::DisconnectRequested
        }
    }

    /// Destination for `request`: inside an intercepted tunnel it is always
    /// the tunnel's server.
    fn destination(&self, request: &HttpRequest) -> Option<String> {
        if self.mitming {
            if let Some(server) = &self.current_server {
                return Some(server.host_and_port().to_string());
            }
        }
        identify_host_and_port(request)
    }

    fn server_for(&mut self, request: &HttpRequest, host_and_port: &str) -> ServerHandle {
        if self.mitming || self.conn.is_tunneling() {
            if let Some(server) = &self.current_server {
                return server.clone();
            }
        }
        let key = host_and_port.to_ascii_lowercase();
        if !request.is_connect() {
            if let Some(server) = self
                .servers_by_host
                .get(&key)
                .and_then(|id| self.servers.get(id))
            {
                return server.clone();
            }
        }

        let chained_proxy = self.ctx.chained_proxy_manager.as_ref().and_then(|manager| {
            manager
                .lookup_chained_proxies(request, host_and_port)
                .into_iter()
                .next()
        });
        if let Some(proxy) = &chained_proxy {
            debug!("{}: {} goes through {}", self.conn.label(), host_and_port, proxy.address);
        }

        let server = server_conn::spawn(
            Arc::clone(&self.ctx),
            self.handle.clone(),
            self.client_addr,
            self.proxy_protocol,
            host_and_port.to_string(),
            chained_proxy,
        );
        self.servers.insert(server.id(), server.clone());
        self.servers_by_host.insert(key, server.id());
        server
    }

    /// Hand `command` to `server`, waiting first if it is still running a
    /// connection flow.
    async fn write_to_server(&mut self, server: &ServerHandle, command: ServerCommand) {
        if server.is_connecting()
            && !server.wait_for_flow(self.ctx.config.flow_wait_timeout()).await
        {
            warn!(
                "{}: timed out waiting for {} to connect, dropping write",
                self.conn.label(),
                server.host_and_port()
            );
            return;
        }
        if !server.send(command) {
            debug!("{}: {} is gone, dropping write", self.conn.label(), server.host_and_port());
        }
    }
}

#[async_trait]
impl ProxyConnection for ClientConnection {
    fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    async fn read_initial(&mut self, object: HttpObject) -> ConnectionState {
        let HttpObject::Request(mut request) = object else {
            debug!("{}: expected a request, got {:?}", self.conn.label(), object);
            return ConnectionState::AwaitingInitial;
        };
        self.ctx
            .track(|tracker| tracker.request_received_from_client(self.client_addr, &request));
        debug!("{}: {}", self.conn.label(), request);
        self.current_request = Some(request.head_only());

        if self.authentication_required(&mut request) {
            return ConnectionState::AwaitingProxyAuthentication;
        }

        if let Some(filter) = self.ctx.request_filter.clone() {
            if let Some(response) = filter.filter(&mut request) {
                return self.respond_with_short_circuit(Some(&request), response);
            }
        }

        if !self.ctx.config.allow_requests_to_origin_server
            && !request.is_connect()
            && !self.mitming
            && !is_absolute_uri(&request.uri)
        {
            info!("{}: origin-form request {} to the proxy", self.conn.label(), request.uri);
            return self.write_bad_request(&request);
        }

        let Some(host_and_port) = self.destination(&request) else {
            info!("{}: no host:port for {}", self.conn.label(), request.uri);
            return self.write_bad_gateway(&request);
        };

        let server = self.server_for(&request, &host_and_port);
        self.current_server = Some(server.clone());

        let original = request.clone();
        self.rewrite_request(&mut request, server.is_chained());

        let next = if request.is_connect() {
            ConnectionState::NegotiatingConnect
        } else if request.body.is_some() {
            ConnectionState::AwaitingInitial
        } else {
            ConnectionState::AwaitingChunk
        };
        if !request.is_connect() {
            self.pending_responses += 1;
        }

        self.write_to_server(&server, ServerCommand::Write { request, original })
            .await;
        next
    }

    async fn read_chunk(&mut self, object: HttpObject) {
        let HttpObject::Content(content) = object else {
            return;
        };
        match self.current_server.clone() {
            Some(server) => {
                self.write_to_server(&server, ServerCommand::WriteContent(content))
                    .await
            }
            None => debug!("{}: dropping body chunk without a server", self.conn.label()),
        }
    }

    async fn read_raw(&mut self, buf: Bytes) {
        match &self.current_server {
            Some(server) => {
                server.send(ServerCommand::WriteRaw(buf));
            }
            None => debug!("{}: dropping {} tunnel bytes", self.conn.label(), buf.len()),
        }
    }
}
