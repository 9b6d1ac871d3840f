//! Protocol state of a single connection

use std::fmt;

/// Where a connection is in its lifecycle. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Opening the underlying socket
    Connecting,
    /// Running a TLS handshake
    Handshaking,
    /// Switching a CONNECT into a tunnel or an intercepted channel
    NegotiatingConnect,
    /// Waiting for a chained proxy to acknowledge a forwarded CONNECT
    AwaitingConnectOk,
    /// A 407 challenge was sent and credentials are expected
    AwaitingProxyAuthentication,
    /// Ready for the head of the next message
    AwaitingInitial,
    /// In the middle of a message body
    AwaitingChunk,
    /// A graceful close was requested
    DisconnectRequested,
    /// The socket is gone
    Disconnected,
}

impl ConnectionState {
    /// States that only occur while a connection flow is bringing the socket up
    pub fn is_part_of_connection_flow(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Handshaking
                | ConnectionState::NegotiatingConnect
                | ConnectionState::AwaitingConnectOk
        )
    }

    pub fn is_disconnecting_or_disconnected(self) -> bool {
        matches!(
            self,
            ConnectionState::DisconnectRequested | ConnectionState::Disconnected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::NegotiatingConnect => "NEGOTIATING_CONNECT",
            ConnectionState::AwaitingConnectOk => "AWAITING_CONNECT_OK",
            ConnectionState::AwaitingProxyAuthentication => "AWAITING_PROXY_AUTHENTICATION",
            ConnectionState::AwaitingInitial => "AWAITING_INITIAL",
            ConnectionState::AwaitingChunk => "AWAITING_CHUNK",
            ConnectionState::DisconnectRequested => "DISCONNECT_REQUESTED",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}
