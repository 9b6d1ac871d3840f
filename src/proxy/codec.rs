//! HTTP/1.x codec
//!
//! The decoder turns socket bytes into a head (`HttpRequest`/`HttpResponse`)
//! followed by body pieces (`HttpContent`, the last one flagged). Messages
//! without a body are emitted as full messages carrying an empty body, so
//! every message ends with exactly one object for which
//! [`is_last_chunk`](crate::utils::is_last_chunk) is true.
//!
//! After a CONNECT request, a 2xx answer to CONNECT or a 101 response the
//! decoder pauses and leaves the remaining bytes in the buffer: what follows
//! is tunnel or TLS traffic, not HTTP.

use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::models::{HttpContent, HttpObject, HttpRequest, HttpResponse};
use crate::utils::{content_length, is_content_always_empty, is_transfer_encoding_chunked};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use std::collections::VecDeque;
use tracing::{debug, trace};

const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Parser limits, taken from the proxy configuration
#[derive(Debug, Clone, Copy)]
pub struct CodecLimits {
    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    pub max_headers: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_initial_line_length: 8192,
            max_header_size: 16384,
            max_headers: 100,
        }
    }
}

impl CodecLimits {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            max_initial_line_length: config.max_initial_line_length,
            max_header_size: config.max_header_size,
            max_headers: config.max_headers,
        }
    }
}

/// Which side of the exchange the decoder parses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    UntilClose,
    Paused,
}

#[derive(Debug)]
pub struct HttpDecoder {
    role: Role,
    state: DecodeState,
    limits: CodecLimits,
    /// Methods of requests sent to the peer whose responses are still due
    pending_methods: VecDeque<Method>,
    trailers: HeaderMap,
}

enum Framing {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl HttpDecoder {
    pub fn new(role: Role, limits: CodecLimits) -> Self {
        Self {
            role,
            state: DecodeState::Head,
            limits,
            pending_methods: VecDeque::new(),
            trailers: HeaderMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Record a request written to the peer so its response is framed correctly.
    pub fn expect_response_to(&mut self, method: Method) {
        self.pending_methods.push_back(method);
    }

    pub fn is_paused(&self) -> bool {
        self.state == DecodeState::Paused
    }

    /// Whether a message is partially decoded.
    pub fn in_message(&self) -> bool {
        !matches!(self.state, DecodeState::Head | DecodeState::Paused)
    }

    /// Decode the next object from `buf`, or `None` when more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<HttpObject>> {
        loop {
            match self.state {
                DecodeState::Paused => return Ok(None),
                DecodeState::Head => return self.decode_head(buf),
                DecodeState::Length(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.state = DecodeState::Head;
                        return Ok(Some(HttpObject::Content(HttpContent::last(data))));
                    }
                    self.state = DecodeState::Length(remaining);
                    return Ok(Some(HttpObject::Content(HttpContent::chunk(data))));
                }
                DecodeState::ChunkSize => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > MAX_CHUNK_SIZE_LINE {
                            return Err(Error::Parse("chunk size line too long".to_string()));
                        }
                        return Ok(None);
                    };
                    let line = buf.split_to(line_end + 2);
                    let size = parse_chunk_size(&line[..line_end])?;
                    self.state = if size == 0 {
                        DecodeState::Trailers
                    } else {
                        DecodeState::ChunkData(size)
                    };
                }
                DecodeState::ChunkData(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        DecodeState::ChunkDataEnd
                    } else {
                        DecodeState::ChunkData(remaining)
                    };
                    return Ok(Some(HttpObject::Content(HttpContent::chunk(data))));
                }
                DecodeState::ChunkDataEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::Parse("missing CRLF after chunk data".to_string()));
                    }
                    buf.advance(2);
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::Trailers => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > self.limits.max_header_size {
                            return Err(Error::Parse("trailer section too large".to_string()));
                        }
                        return Ok(None);
                    };
                    let line = buf.split_to(line_end + 2);
                    if line_end == 0 {
                        self.state = DecodeState::Head;
                        let mut last = HttpContent::empty_last();
                        last.trailers = std::mem::take(&mut self.trailers);
                        return Ok(Some(HttpObject::Content(last)));
                    }
                    self.push_trailer(&line[..line_end]);
                }
                DecodeState::UntilClose => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let data = buf.split().freeze();
                    return Ok(Some(HttpObject::Content(HttpContent::chunk(data))));
                }
            }
        }
    }

    /// Called once the peer closed: ends a close-delimited body.
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<HttpObject>> {
        if let Some(object) = self.decode(buf)? {
            return Ok(Some(object));
        }
        match self.state {
            DecodeState::UntilClose => {
                self.state = DecodeState::Head;
                Ok(Some(HttpObject::Content(HttpContent::empty_last())))
            }
            DecodeState::Head | DecodeState::Paused => Ok(None),
            _ => {
                debug!("Peer closed in the middle of a message body");
                Ok(None)
            }
        }
    }

    fn push_trailer(&mut self, line: &[u8]) {
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            trace!("Ignoring malformed trailer line");
            return;
        };
        let name = HeaderName::from_bytes(trim_ascii(&line[..colon]));
        let value = HeaderValue::from_bytes(trim_ascii(&line[colon + 1..]));
        if let (Ok(name), Ok(value)) = (name, value) {
            self.trailers.append(name, value);
        }
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<Option<HttpObject>> {
        // Stray CRLFs between messages are tolerated
        while buf.starts_with(b"\r\n") {
            buf.advance(2);
        }
        if buf.is_empty() {
            return Ok(None);
        }

        match find_crlf(buf) {
            Some(line_end) if line_end > self.limits.max_initial_line_length => {
                return Err(Error::Parse(format!(
                    "initial line is longer than {} bytes",
                    self.limits.max_initial_line_length
                )));
            }
            None if buf.len() > self.limits.max_initial_line_length => {
                return Err(Error::Parse(format!(
                    "initial line is longer than {} bytes",
                    self.limits.max_initial_line_length
                )));
            }
            _ => {}
        }

        let parsed = match self.role {
            Role::Request => self.parse_request(buf)?,
            Role::Response => self.parse_response(buf)?,
        };

        let Some((object, head_len)) = parsed else {
            if buf.len() > self.limits.max_header_size {
                return Err(Error::Parse(format!(
                    "message head is larger than {} bytes",
                    self.limits.max_header_size
                )));
            }
            return Ok(None);
        };
        buf.advance(head_len);
        Ok(Some(object))
    }

    fn parse_request(&mut self, buf: &BytesMut) -> Result<Option<(HttpObject, usize)>> {
        let mut headers = vec![httparse::EMPTY_HEADER; self.limits.max_headers];
        let mut parsed = httparse::Request::new(&mut headers);
        let head_len = match parsed.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let method = parsed.method.unwrap_or("GET");
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| Error::Parse(format!("invalid method {}: {}", method, e)))?;
        let mut request = HttpRequest::new(
            method,
            parsed.path.unwrap_or("/"),
            version_from_httparse(parsed.version),
        );
        request.headers = header_map(parsed.headers)?;

        let length = content_length(&request.headers)?;
        let framing = if request.is_connect() {
            self.state = DecodeState::Paused;
            Framing::Empty
        } else if request.headers.contains_key(TRANSFER_ENCODING) {
            if !is_transfer_encoding_chunked(&request.headers) {
                return Err(Error::Parse(
                    "request transfer coding must end with chunked".to_string(),
                ));
            }
            drop_length_with_transfer_coding(&mut request.headers);
            Framing::Chunked
        } else {
            match length {
                Some(0) | None => Framing::Empty,
                Some(len) => Framing::Length(len),
            }
        };

        if let Framing::Empty = framing {
            request.body = Some(Bytes::new());
        }
        self.enter_body(framing);
        Ok(Some((HttpObject::Request(request), head_len)))
    }

    fn parse_response(&mut self, buf: &BytesMut) -> Result<Option<(HttpObject, usize)>> {
        let mut headers = vec![httparse::EMPTY_HEADER; self.limits.max_headers];
        let mut parsed = httparse::Response::new(&mut headers);
        let head_len = match parsed.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let code = parsed.code.unwrap_or(200);
        let status = StatusCode::from_u16(code)
            .map_err(|e| Error::Parse(format!("invalid status {}: {}", code, e)))?;
        let mut response = HttpResponse::new(version_from_httparse(parsed.version), status);
        if let Some(reason) = parsed.reason {
            if status.canonical_reason() != Some(reason) {
                response.reason = Some(reason.to_string());
            }
        }
        response.headers = header_map(parsed.headers)?;

        let framing = if status == StatusCode::SWITCHING_PROTOCOLS {
            self.pending_methods.pop_front();
            self.state = DecodeState::Paused;
            Framing::Empty
        } else if status.is_informational() {
            // Interim responses do not answer the request
            Framing::Empty
        } else {
            let method = self.pending_methods.pop_front();
            match method {
                Some(Method::HEAD) => Framing::Empty,
                Some(Method::CONNECT) if status.is_success() => {
                    self.state = DecodeState::Paused;
                    Framing::Empty
                }
                _ if is_content_always_empty(status) => Framing::Empty,
                _ if response.headers.contains_key(TRANSFER_ENCODING) => {
                    drop_length_with_transfer_coding(&mut response.headers);
                    if is_transfer_encoding_chunked(&response.headers) {
                        Framing::Chunked
                    } else {
                        Framing::UntilClose
                    }
                }
                _ => match content_length(&response.headers)? {
                    Some(0) => Framing::Empty,
                    Some(len) => Framing::Length(len),
                    None => Framing::UntilClose,
                },
            }
        };

        if let Framing::Empty = framing {
            response.body = Some(Bytes::new());
        }
        self.enter_body(framing);
        Ok(Some((HttpObject::Response(response), head_len)))
    }

    fn enter_body(&mut self, framing: Framing) {
        if self.state == DecodeState::Paused {
            return;
        }
        self.state = match framing {
            Framing::Empty => DecodeState::Head,
            Framing::Length(len) => DecodeState::Length(len),
            Framing::Chunked => DecodeState::ChunkSize,
            Framing::UntilClose => DecodeState::UntilClose,
        };
    }
}

/// `Transfer-Encoding` overrides `Content-Length`, which must not be relayed
/// alongside it.
fn drop_length_with_transfer_coding(headers: &mut HeaderMap) {
    if headers.remove(CONTENT_LENGTH).is_some() {
        debug!("Dropping Content-Length sent together with Transfer-Encoding");
    }
}

/// Serializes heads and body pieces, chunk-framing bodies of chunked messages.
#[derive(Debug, Default)]
pub struct HttpEncoder {
    chunked: bool,
}

impl HttpEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, object: &HttpObject, dst: &mut BytesMut) {
        match object {
            HttpObject::Request(request) => {
                dst.put_slice(
                    format!("{} {} {:?}\r\n", request.method, request.uri, request.version)
                        .as_bytes(),
                );
                self.encode_head_fields(&request.headers, dst);
                if let Some(body) = &request.body {
                    self.encode_full_body(body, dst);
                }
            }
            HttpObject::Response(response) => {
                dst.put_slice(
                    format!(
                        "{:?} {} {}\r\n",
                        response.version,
                        response.status.as_u16(),
                        response.reason_phrase()
                    )
                    .as_bytes(),
                );
                self.encode_head_fields(&response.headers, dst);
                if let Some(body) = &response.body {
                    self.encode_full_body(body, dst);
                }
            }
            HttpObject::Content(content) => self.encode_content(content, dst),
        }
    }

    fn encode_head_fields(&mut self, headers: &HeaderMap, dst: &mut BytesMut) {
        for (name, value) in headers.iter() {
            dst.put_slice(name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        self.chunked = is_transfer_encoding_chunked(headers);
    }

    fn encode_full_body(&mut self, body: &Bytes, dst: &mut BytesMut) {
        let last = HttpContent::last(body.clone());
        self.encode_content(&last, dst);
    }

    fn encode_content(&mut self, content: &HttpContent, dst: &mut BytesMut) {
        if !self.chunked {
            dst.put_slice(&content.data);
            return;
        }
        // A zero-length chunk would terminate the body early
        if !content.data.is_empty() {
            dst.put_slice(format!("{:x}\r\n", content.data.len()).as_bytes());
            dst.put_slice(&content.data);
            dst.put_slice(b"\r\n");
        }
        if content.last {
            dst.put_slice(b"0\r\n");
            for (name, value) in content.trailers.iter() {
                dst.put_slice(name.as_str().as_bytes());
                dst.put_slice(b": ");
                dst.put_slice(value.as_bytes());
                dst.put_slice(b"\r\n");
            }
            dst.put_slice(b"\r\n");
            self.chunked = false;
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end.max(start)]
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let size = match line.iter().position(|b| *b == b';') {
        Some(ext) => &line[..ext],
        None => line,
    };
    let size = std::str::from_utf8(trim_ascii(size))
        .map_err(|_| Error::Parse("chunk size is not ASCII".to_string()))?;
    u64::from_str_radix(size, 16)
        .map_err(|_| Error::Parse(format!("invalid chunk size {:?}", size)))
}

fn version_from_httparse(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(raw.len());
    for header in raw {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| Error::Parse(format!("invalid header name {:?}: {}", header.name, e)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|e| Error::Parse(format!("invalid value for {:?}: {}", header.name, e)))?;
        map.append(name, value);
    }
    Ok(map)
}
