//! Connection flows
//!
//! A [`ConnectionFlow`] is the ordered list of steps that brings a
//! server-facing connection from nothing to ready-for-traffic. Steps are
//! plain values; the server-facing connection runs the ones that act on its
//! own socket and hands the ones marked [`FlowStep::runs_on_client`] to the
//! client-facing connection.

use crate::error::Error;
use crate::models::{HttpObject, HttpRequest, Message};
use crate::proxy::chain::ChainedProxy;
use crate::proxy::state::ConnectionState;
use std::collections::VecDeque;
use std::fmt;

/// Who the outbound TLS handshake is with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsTarget {
    /// An encrypted chained proxy, verified against `server_name`
    ChainedProxy { server_name: String },
    /// The origin behind an intercepted CONNECT
    Origin { host: String, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStep {
    /// Open the outbound socket
    ConnectChannel,
    /// Client-role TLS handshake on the outbound socket
    EncryptChannel(TlsTarget),
    /// Forward the CONNECT to the chained proxy and wait for its 2xx
    ConnectWithChainedProxy,
    /// Switch the server-facing connection to raw relaying
    StartTunneling,
    /// Send `200 Connection established` to the client
    RespondConnectSuccessful,
    /// Switch the client-facing connection to raw relaying
    ClientStartTunneling,
    /// Server-role TLS handshake on the client socket
    MitmEncryptClientChannel { host: String },
}

/// What happens after a step's action completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSuccess {
    Advance,
    /// Stay on this step and feed it inbound messages until it decides
    AwaitRead,
}

/// Verdict of a paused step on an inbound message
#[derive(Debug)]
pub enum StepRead {
    /// Not decisive, keep waiting
    Continue,
    Advance,
    Fail(Error),
}

impl FlowStep {
    pub fn state(&self) -> ConnectionState {
        match self {
            FlowStep::ConnectChannel => ConnectionState::Connecting,
            FlowStep::EncryptChannel(_) | FlowStep::MitmEncryptClientChannel { .. } => {
                ConnectionState::Handshaking
            }
            FlowStep::ConnectWithChainedProxy => ConnectionState::AwaitingConnectOk,
            FlowStep::StartTunneling
            | FlowStep::RespondConnectSuccessful
            | FlowStep::ClientStartTunneling => ConnectionState::NegotiatingConnect,
        }
    }

    /// Steps that take over the CONNECT so it must not be forwarded as is.
    pub fn suppresses_initial_request(&self) -> bool {
        matches!(
            self,
            FlowStep::StartTunneling
                | FlowStep::RespondConnectSuccessful
                | FlowStep::ClientStartTunneling
                | FlowStep::MitmEncryptClientChannel { .. }
        )
    }

    pub fn runs_on_client(&self) -> bool {
        matches!(
            self,
            FlowStep::RespondConnectSuccessful
                | FlowStep::ClientStartTunneling
                | FlowStep::MitmEncryptClientChannel { .. }
        )
    }

    pub fn on_success(&self) -> OnSuccess {
        match self {
            FlowStep::ConnectWithChainedProxy => OnSuccess::AwaitRead,
            _ => OnSuccess::Advance,
        }
    }

    /// Inspect a message that arrived while this step has the flow paused.
    pub fn read(&self, message: &Message) -> StepRead {
        match (self, message) {
            (FlowStep::ConnectWithChainedProxy, Message::Http(HttpObject::Response(response))) => {
                if response.status.is_success() {
                    StepRead::Advance
                } else {
                    StepRead::Fail(Error::ChainedProxyRefused(response.status.as_u16()))
                }
            }
            _ => StepRead::Continue,
        }
    }
}

impl fmt::Display for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStep::ConnectChannel => write!(f, "ConnectChannel"),
            FlowStep::EncryptChannel(TlsTarget::ChainedProxy { server_name }) => {
                write!(f, "EncryptChannel({})", server_name)
            }
            FlowStep::EncryptChannel(TlsTarget::Origin { host, port }) => {
                write!(f, "EncryptChannel({}:{})", host, port)
            }
            FlowStep::ConnectWithChainedProxy => write!(f, "ConnectWithChainedProxy"),
            FlowStep::StartTunneling => write!(f, "StartTunneling"),
            FlowStep::RespondConnectSuccessful => write!(f, "RespondConnectSuccessful"),
            FlowStep::ClientStartTunneling => write!(f, "ClientStartTunneling"),
            FlowStep::MitmEncryptClientChannel { host } => {
                write!(f, "MitmEncryptClientChannel({})", host)
            }
        }
    }
}

/// Ordered, single-use queue of steps.
#[derive(Debug, Default)]
pub struct ConnectionFlow {
    steps: VecDeque<FlowStep>,
    suppress_initial_request: bool,
}

impl ConnectionFlow {
    pub fn first(step: FlowStep) -> Self {
        Self::default().then(step)
    }

    pub fn then(mut self, step: FlowStep) -> Self {
        self.steps.push_back(step);
        self
    }

    /// Next step to run, or `None` once the flow has succeeded.
    pub fn advance(&mut self) -> Option<FlowStep> {
        let step = self.steps.pop_front()?;
        self.suppress_initial_request |= step.suppresses_initial_request();
        Some(step)
    }

    /// Whether any step run so far took over the initial request.
    pub fn suppress_initial_request(&self) -> bool {
        self.suppress_initial_request
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }

    /// The flow for `initial_request`, sent either to `chained_proxy` or
    /// directly to `host`:`port`.
    pub fn for_request(
        initial_request: &HttpRequest,
        chained_proxy: Option<&ChainedProxy>,
        mitm: bool,
        host: &str,
        port: u16,
    ) -> Self {
        let mut flow = ConnectionFlow::first(FlowStep::ConnectChannel);

        if let Some(proxy) = chained_proxy {
            if proxy.requires_encryption {
                flow = flow.then(FlowStep::EncryptChannel(TlsTarget::ChainedProxy {
                    server_name: proxy.tls_server_name(),
                }));
            }
        }

        if initial_request.is_connect() {
            if chained_proxy.is_some() {
                flow = flow.then(FlowStep::ConnectWithChainedProxy);
            }

            flow = if mitm {
                flow.then(FlowStep::EncryptChannel(TlsTarget::Origin {
                    host: host.to_string(),
                    port,
                }))
                .then(FlowStep::RespondConnectSuccessful)
                .then(FlowStep::MitmEncryptClientChannel {
                    host: host.to_string(),
                })
            } else {
                flow.then(FlowStep::StartTunneling)
                    .then(FlowStep::RespondConnectSuccessful)
                    .then(FlowStep::ClientStartTunneling)
            };
        }

        flow
    }
}
