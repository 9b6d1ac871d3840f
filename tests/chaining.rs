mod common;

use chain_proxy::models::HttpRequest;
use chain_proxy::proxy::transport::BoxedSocket;
use chain_proxy::proxy::{ChainedProxy, ChainedProxyManager, ConfiguredChainedProxies, TcpTransport, Transport};
use chain_proxy::ProxyServer;
use common::*;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn chained(address: SocketAddr) -> ChainedProxy {
    ChainedProxy {
        address: address.to_string(),
        requires_encryption: false,
        server_name: None,
        transport: "tcp".to_string(),
    }
}

/// An address nothing listens on
async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Chained proxy manager that records every failure it is told about
#[derive(Default)]
struct RecordingChain {
    proxies: Vec<ChainedProxy>,
    errors: Mutex<Vec<String>>,
}

impl ChainedProxyManager for RecordingChain {
    fn lookup_chained_proxies(&self, _request: &HttpRequest, _host_and_port: &str) -> Vec<ChainedProxy> {
        self.proxies.clone()
    }

    fn on_communication_error(&self, host_and_port: &str) {
        self.errors.lock().unwrap().push(host_and_port.to_string());
    }
}

#[tokio::test]
async fn test_unreachable_chained_proxy_falls_back_to_origin() {
    let origin = spawn_origin(|request| ok(request.path())).await;
    let dead = dead_address().await;
    let chain = Arc::new(RecordingChain {
        proxies: vec![chained(dead)],
        ..Default::default()
    });
    let server = ProxyServer::with_config(proxy_config()).with_chained_proxy_manager(chain.clone());
    let proxy = start_proxy(server).await;
    let mut client = ResponseReader::new(connect(&proxy).await);

    client.send(&get(&origin.url("/fallback"))).await;
    let response = client.next().await.expect("response");

    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "/fallback");
    assert_eq!(*chain.errors.lock().unwrap(), vec![dead.to_string()]);
    // Direct requests use the origin form
    assert_eq!(origin.requests()[0].request_line, "GET /fallback HTTP/1.1");

    // Later requests on the same connection keep going direct
    client.send(&get(&origin.url("/again"))).await;
    assert_eq!(client.next().await.expect("response").body_text(), "/again");
    assert_eq!(chain.errors.lock().unwrap().len(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_configured_chain_counts_one_error_per_failed_attempt() {
    let origin = spawn_origin(|_| ok("direct")).await;
    let dead = dead_address().await;
    let chain = Arc::new(ConfiguredChainedProxies::new(vec![chained(dead)], Vec::new()));
    let server = ProxyServer::with_config(proxy_config()).with_chained_proxy_manager(chain.clone());
    let proxy = start_proxy(server).await;

    let mut client = ResponseReader::new(connect(&proxy).await);
    client.send(&get(&origin.url("/"))).await;
    assert_eq!(client.next().await.expect("response").body_text(), "direct");
    assert_eq!(chain.communication_errors(&dead.to_string()), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_requests_through_chained_proxy_keep_absolute_uri() {
    // The "chained proxy" is a plain HTTP server that reports what it saw
    let upstream = spawn_origin(|request| ok(&request.request_line)).await;
    let chain = Arc::new(RecordingChain {
        proxies: vec![chained(upstream.addr)],
        ..Default::default()
    });
    let server = ProxyServer::with_config(proxy_config()).with_chained_proxy_manager(chain.clone());
    let proxy = start_proxy(server).await;
    let mut client = ResponseReader::new(connect(&proxy).await);

    client
        .send(b"GET http://origin.example:8080/path?q=1 HTTP/1.1\r\nHost: origin.example:8080\r\n\r\n")
        .await;
    let response = client.next().await.expect("response");

    assert_eq!(response.body_text(), "GET http://origin.example:8080/path?q=1 HTTP/1.1");
    let seen = &upstream.requests()[0];
    assert_eq!(seen.header("via"), Some("1.1 test-proxy"));
    assert!(chain.errors.lock().unwrap().is_empty());

    proxy.stop().await;
}

/// TCP transport that counts the connections it opens
#[derive(Default)]
struct CountingTransport {
    connects: AtomicUsize,
}

#[async_trait::async_trait]
impl Transport for CountingTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> chain_proxy::Result<BoxedSocket> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        TcpTransport::default().connect(addr, timeout).await
    }
}

#[tokio::test]
async fn test_chained_proxy_connects_through_server_transport() {
    let upstream = spawn_origin(|request| ok(&request.request_line)).await;
    let chain = Arc::new(RecordingChain {
        proxies: vec![chained(upstream.addr)],
        ..Default::default()
    });
    let transport = Arc::new(CountingTransport::default());
    let server = ProxyServer::with_config(proxy_config())
        .with_chained_proxy_manager(chain)
        .with_transport(transport.clone());
    let proxy = start_proxy(server).await;
    let mut client = ResponseReader::new(connect(&proxy).await);

    client
        .send(b"GET http://origin.example/ HTTP/1.1\r\nHost: origin.example\r\n\r\n")
        .await;
    assert_eq!(client.next().await.expect("response").status, 200);
    assert_eq!(upstream.connection_count(), 1);
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

    proxy.stop().await;
}

/// A chained proxy that answers CONNECT with `status` and then echoes the tunnel.
async fn spawn_connect_proxy(status: &'static str) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&seen);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let recorded = Arc::clone(&recorded);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let Some(request) = read_request(&mut stream, &mut buf).await else {
                    return;
                };
                recorded.lock().unwrap().push(request.request_line.clone());
                let reply = format!("HTTP/1.1 {}\r\nContent-Length: 0\r\n\r\n", status);
                if stream.write_all(reply.as_bytes()).await.is_err() || !status.starts_with('2') {
                    return;
                }
                let mut chunk = [0u8; 1024];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, seen)
}

/// Plain TCP echo server
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn open_tunnel(proxy_addr: SocketAddr, target: &str) -> ResponseReader<tokio::net::TcpStream> {
    let stream = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
    let mut client = ResponseReader::new(stream);
    let connect = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    client.send(connect.as_bytes()).await;
    client
}

async fn echo_round_trip(client: &mut ResponseReader<tokio::net::TcpStream>, payload: &[u8]) -> Vec<u8> {
    client.send(payload).await;
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(TIMEOUT, client.stream.read_exact(&mut echoed))
        .await
        .expect("echo within the timeout")
        .unwrap();
    echoed
}

#[tokio::test]
async fn test_connect_is_forwarded_through_chained_proxy() {
    let (upstream, seen) = spawn_connect_proxy("200 Connection established").await;
    let chain = Arc::new(RecordingChain {
        proxies: vec![chained(upstream)],
        ..Default::default()
    });
    let server = ProxyServer::with_config(proxy_config()).with_chained_proxy_manager(chain.clone());
    let proxy = start_proxy(server).await;

    let mut client = open_tunnel(proxy.local_addr(), "secure.example:443").await;
    let response = client.next_for("CONNECT").await.expect("CONNECT response");
    assert_eq!(response.status, 200);

    assert_eq!(echo_round_trip(&mut client, b"\x16\x03\x01 tunnel").await, b"\x16\x03\x01 tunnel");
    assert_eq!(*seen.lock().unwrap(), vec!["CONNECT secure.example:443 HTTP/1.1".to_string()]);

    proxy.stop().await;
}

#[tokio::test]
async fn test_chained_proxy_refusing_connect_falls_back() {
    let (upstream, seen) = spawn_connect_proxy("502 Bad Gateway").await;
    let echo = spawn_echo().await;
    let chain = Arc::new(RecordingChain {
        proxies: vec![chained(upstream)],
        ..Default::default()
    });
    let server = ProxyServer::with_config(proxy_config()).with_chained_proxy_manager(chain.clone());
    let proxy = start_proxy(server).await;

    let mut client = open_tunnel(proxy.local_addr(), &echo.to_string()).await;
    let response = client.next_for("CONNECT").await.expect("CONNECT response");
    assert_eq!(response.status, 200);
    assert_eq!(echo_round_trip(&mut client, b"direct now").await, b"direct now");

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(*chain.errors.lock().unwrap(), vec![upstream.to_string()]);

    proxy.stop().await;
}
