//! Helpers shared by the integration tests: a proxy on an ephemeral port,
//! scriptable origin servers and a small HTTP/1.1 response reader.

#![allow(dead_code)]

use chain_proxy::{ProxyConfig, ProxyServer, RunningProxy};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn proxy_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.proxy_alias = Some("test-proxy".to_string());
    config.shutdown_grace_secs = 1;
    config.connect_timeout_secs = 5;
    config.flow_wait_timeout_secs = 5;
    config
}

pub async fn start_proxy(server: ProxyServer) -> RunningProxy {
    server.start().await.expect("proxy starts")
}

pub async fn connect(proxy: &RunningProxy) -> TcpStream {
    TcpStream::connect(proxy.local_addr()).await.expect("connect to proxy")
}

/// A request as the origin received it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        self.request_line.split(' ').nth(1).unwrap_or("")
    }
}

pub type Responder = Arc<dyn Fn(&RecordedRequest) -> Vec<u8> + Send + Sync>;

/// An HTTP/1.1 origin that answers every request through `respond`
pub struct Origin {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    pub connections: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl Origin {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub async fn spawn_origin<F>(respond: F) -> Origin
where
    F: Fn(&RecordedRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let respond: Responder = Arc::new(respond);

    let origin = Origin {
        addr,
        requests: Arc::clone(&requests),
        connections: Arc::clone(&connections),
        closed: Arc::clone(&closed),
    };

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            connections.fetch_add(1, Ordering::SeqCst);
            let requests = Arc::clone(&requests);
            let closed = Arc::clone(&closed);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                serve_http(stream, requests, respond).await;
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    origin
}

/// Answer requests on `stream` until the peer closes or a response asks to close.
pub async fn serve_http<S>(mut stream: S, requests: Arc<Mutex<Vec<RecordedRequest>>>, respond: Responder)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let Some(request) = read_request(&mut stream, &mut buf).await else {
            return;
        };
        let response = respond(&request);
        requests.lock().unwrap().push(request);
        if stream.write_all(&response).await.is_err() {
            return;
        }
        let _ = stream.flush().await;
        if String::from_utf8_lossy(&response)
            .to_ascii_lowercase()
            .contains("connection: close")
        {
            let _ = stream.shutdown().await;
            return;
        }
    }
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 8192];
    match stream.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_head(head: &str) -> (String, Vec<(String, String)>) {
    let mut lines = head.split("\r\n");
    let first = lines.next().unwrap_or_default().to_string();
    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();
    (first, headers)
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Read one request with a Content-Length or chunked body.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> Option<RecordedRequest> {
    let (request_line, headers) = loop {
        if let Some(end) = find_head_end(buf) {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            buf.drain(..end);
            break parse_head(&head);
        }
        if !fill(stream, buf).await {
            return None;
        }
    };

    let body = if header_value(&headers, "transfer-encoding")
        .map_or(false, |te| te.to_ascii_lowercase().contains("chunked"))
    {
        read_chunked(stream, buf).await?
    } else {
        let length = header_value(&headers, "content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        read_exact_body(stream, buf, length).await?
    };

    Some(RecordedRequest {
        request_line,
        headers,
        body,
    })
}

async fn read_exact_body<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>, length: usize) -> Option<Vec<u8>> {
    while buf.len() < length {
        if !fill(stream, buf).await {
            return None;
        }
    }
    Some(buf.drain(..length).collect())
}

async fn read_line<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> Option<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            buf.drain(..pos + 2);
            return Some(line);
        }
        if !fill(stream, buf).await {
            return None;
        }
    }
}

async fn read_chunked<S: AsyncRead + Unpin>(stream: &mut S, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(stream, buf).await?;
        let size = usize::from_str_radix(size_line.split(';').next()?.trim(), 16).ok()?;
        if size == 0 {
            // Trailers end with an empty line
            while !read_line(stream, buf).await?.is_empty() {}
            return Some(body);
        }
        body.extend(read_exact_body(stream, buf, size).await?);
        read_line(stream, buf).await?;
    }
}

/// A response as the client received it
#[derive(Debug, Clone)]
pub struct ReceivedResponse {
    pub status: u16,
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads consecutive responses from one connection, keeping bytes that
/// belong to the next response.
pub struct ResponseReader<S> {
    pub stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ResponseReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next response to a request with method `method`. Responses to HEAD
    /// and CONNECT are read without a body.
    pub async fn next_for(&mut self, method: &str) -> Option<ReceivedResponse> {
        let bodyless = method == "HEAD" || method == "CONNECT";
        tokio::time::timeout(TIMEOUT, self.read_response(bodyless))
            .await
            .expect("response within the timeout")
    }

    pub async fn next(&mut self) -> Option<ReceivedResponse> {
        self.next_for("GET").await
    }

    async fn read_response(&mut self, bodyless: bool) -> Option<ReceivedResponse> {
        let (status_line, headers) = loop {
            if let Some(end) = find_head_end(&self.buf) {
                let head = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                self.buf.drain(..end);
                break parse_head(&head);
            }
            if !fill(&mut self.stream, &mut self.buf).await {
                return None;
            }
        };
        let status = status_line.split(' ').nth(1)?.parse().ok()?;

        let no_body = bodyless || status / 100 == 1 || status == 204 || status == 304;
        let body = if no_body {
            Vec::new()
        } else if header_value(&headers, "transfer-encoding")
            .map_or(false, |te| te.to_ascii_lowercase().contains("chunked"))
        {
            read_chunked(&mut self.stream, &mut self.buf).await?
        } else if let Some(length) = header_value(&headers, "content-length").and_then(|v| v.parse().ok()) {
            read_exact_body(&mut self.stream, &mut self.buf, length).await?
        } else {
            while fill(&mut self.stream, &mut self.buf).await {}
            std::mem::take(&mut self.buf)
        };

        Some(ReceivedResponse {
            status,
            status_line,
            headers,
            body,
        })
    }

    /// True once the peer has closed the connection.
    pub async fn is_closed(&mut self) -> bool {
        let mut chunk = [0u8; 1];
        match tokio::time::timeout(TIMEOUT, self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) => {
                self.buf.push(chunk[0]);
                false
            }
            Err(_) => false,
        }
    }
}

/// `200 OK` with `body` and a matching Content-Length
pub fn ok(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

pub fn get(url: &str) -> Vec<u8> {
    let host = url
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", url, host).into_bytes()
}

/// Wait until `condition` holds, polling briefly.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
