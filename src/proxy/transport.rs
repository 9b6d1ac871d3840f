//! Socket abstractions used by both sides of the proxy

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpSocket;
use tracing::debug;

/// Anything a connection can run over: plain TCP, TLS, or a rewound stream.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Socket for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedSocket = Box<dyn Socket>;

/// Outbound connector. Accepting stays with the server's listener.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedSocket>;
}

/// Plain TCP transport, optionally bound to a local interface address
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport {
    local_ip: Option<IpAddr>,
}

impl TcpTransport {
    /// Outbound connections originate from `local_ip` when set.
    pub fn bound_to(local_ip: Option<IpAddr>) -> Self {
        Self { local_ip }
    }

    fn open(&self, addr: SocketAddr) -> std::io::Result<TcpSocket> {
        let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(ip) = self.local_ip {
            socket.bind(&SocketAddr::new(ip, 0).into())?;
        }
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        Ok(TcpSocket::from_std_stream(socket.into()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<BoxedSocket> {
        match self.local_ip {
            Some(ip) => debug!("Opening TCP connection to {} from {}", addr, ip),
            None => debug!("Opening TCP connection to {}", addr),
        }
        let socket = self
            .open(addr)
            .map_err(|e| Error::Connect(addr.to_string(), e.to_string()))?;
        let stream = tokio::time::timeout(timeout, socket.connect(addr))
            .await?
            .map_err(|e| Error::Connect(addr.to_string(), e.to_string()))?;
        Ok(Box::new(stream))
    }
}

/// Look up a transport by its configured name.
pub fn transport_for(name: &str) -> Result<Box<dyn Transport>> {
    match name {
        "tcp" | "" => Ok(Box::new(TcpTransport::default())),
        other => Err(Error::Config(format!("unsupported transport: {}", other))),
    }
}

/// A stream that replays bytes read ahead of a protocol switch before
/// reading from the inner stream again.
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (S, Bytes) {
        (self.inner, self.prefix)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let to_copy = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..to_copy]);
            self.prefix.advance(to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_replays_prefix_first() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut rewound = Rewind::new(client, Bytes::from_static(b"hello "));
        server.write_all(b"world").await.unwrap();
        drop(server);

        let mut out = String::new();
        rewound.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_tcp_transport_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let transport = transport_for("tcp").unwrap();
        assert_eq!(transport.name(), "tcp");
        let socket = transport.connect(addr, Duration::from_secs(5)).await;
        assert!(socket.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_transport_binds_local_interface() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(_, peer)| peer) });

        let local_ip: IpAddr = "127.0.0.1".parse().unwrap();
        let transport = TcpTransport::bound_to(Some(local_ip));
        let _socket = transport.connect(addr, Duration::from_secs(5)).await.unwrap();
        let peer = accept.await.unwrap().unwrap();
        assert_eq!(peer.ip(), local_ip);
    }

    #[tokio::test]
    async fn test_tcp_transport_rejects_foreign_interface() {
        // TEST-NET-1 is never assigned to a local interface
        let transport = TcpTransport::bound_to(Some("192.0.2.1".parse().unwrap()));
        let result = transport
            .connect("127.0.0.1:9".parse().unwrap(), Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(Error::Connect(_, _))));
    }

    #[test]
    fn test_unknown_transport_is_rejected() {
        assert!(transport_for("udt").is_err());
    }
}
