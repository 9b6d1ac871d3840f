//! HTTP message model shared by the codec, the connections and the filters

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, Method, StatusCode, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Head of an HTTP request, optionally carrying its complete body.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Request target exactly as it appeared on the request line
    pub uri: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// `Some` when this is a full request (head and entire body in one object)
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>, version: Version) -> Self {
        Self {
            method,
            uri: uri.into(),
            version,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }

    /// Copy of the request line and headers without any body.
    pub fn head_only(&self) -> Self {
        Self {
            method: self.method.clone(),
            uri: self.uri.clone(),
            version: self.version,
            headers: self.headers.clone(),
            body: None,
        }
    }
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {:?}", self.method, self.uri, self.version)
    }
}

/// Head of an HTTP response, optionally carrying its complete body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as received; the canonical one is used when absent
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpResponse {
    pub fn new(version: Version, status: StatusCode) -> Self {
        Self {
            version,
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// A full response whose `Content-Length` matches `body`.
    pub fn full(version: Version, status: StatusCode, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        let mut response = Self::new(version, status);
        response
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        response.body = Some(body);
        response
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason.as_str(),
            None => self.status.canonical_reason().unwrap_or(""),
        }
    }

    /// Copy of the status line and headers without any body.
    pub fn head_only(&self) -> Self {
        Self {
            version: self.version,
            status: self.status,
            reason: self.reason.clone(),
            headers: self.headers.clone(),
            body: None,
        }
    }
}

impl fmt::Display for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {}", self.version, self.status.as_u16(), self.reason_phrase())
    }
}

/// A piece of message body. `last` marks the terminal chunk of a message.
#[derive(Debug, Clone, Default)]
pub struct HttpContent {
    pub data: Bytes,
    pub last: bool,
    /// Trailer fields, only meaningful on the last chunk of a chunked body
    pub trailers: HeaderMap,
}

impl HttpContent {
    pub fn chunk(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last: false,
            trailers: HeaderMap::new(),
        }
    }

    pub fn last(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last: true,
            trailers: HeaderMap::new(),
        }
    }

    pub fn empty_last() -> Self {
        Self::last(Bytes::new())
    }
}

/// Any parsed HTTP unit travelling through a connection.
#[derive(Debug, Clone)]
pub enum HttpObject {
    Request(HttpRequest),
    Response(HttpResponse),
    Content(HttpContent),
}

impl HttpObject {
    pub fn is_message(&self) -> bool {
        !matches!(self, HttpObject::Content(_))
    }

    pub fn as_request(&self) -> Option<&HttpRequest> {
        match self {
            HttpObject::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&HttpResponse> {
        match self {
            HttpObject::Response(response) => Some(response),
            _ => None,
        }
    }
}

impl From<HttpRequest> for HttpObject {
    fn from(request: HttpRequest) -> Self {
        HttpObject::Request(request)
    }
}

impl From<HttpResponse> for HttpObject {
    fn from(response: HttpResponse) -> Self {
        HttpObject::Response(response)
    }
}

impl From<HttpContent> for HttpObject {
    fn from(content: HttpContent) -> Self {
        HttpObject::Content(content)
    }
}

/// Inbound or outbound unit on a connection: parsed HTTP, or raw bytes once tunneling.
#[derive(Debug, Clone)]
pub enum Message {
    Http(HttpObject),
    Raw(Bytes),
}

impl From<HttpObject> for Message {
    fn from(object: HttpObject) -> Self {
        Message::Http(object)
    }
}

impl From<Bytes> for Message {
    fn from(buf: Bytes) -> Self {
        Message::Raw(buf)
    }
}

/// Per-client traffic summary, logged as JSON when the client disconnects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientActivity {
    pub client: String,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub bytes_from_client: u64,
    pub bytes_to_client: u64,
    pub bytes_to_servers: u64,
    pub bytes_from_servers: u64,
    pub connected_at: String,
    pub disconnected_at: Option<String>,
}
