//! HTTP proxying rules: hop-by-hop headers, `Via`, keep-alive, chunking and
//! host:port extraction. Everything here is a pure function over the message
//! model so the connections can share it.

use crate::error::{Error, Result};
use crate::models::{HttpObject, HttpRequest, HttpResponse};
use http::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST,
    TRANSFER_ENCODING, VIA,
};
use http::{HeaderMap, StatusCode, Version};
use tracing::debug;

/// Headers that apply to a single transport hop and are never forwarded.
///
/// `Transfer-Encoding` is deliberately absent: bodies are relayed with the
/// framing they arrived with.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "upgrade",
];

/// De-facto header some clients send instead of `Connection` when talking to a proxy
pub const PROXY_CONNECTION: &str = "proxy-connection";

/// Check if a header is a hop-by-hop header
pub fn is_hop_by_hop_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Remove every hop-by-hop header. Running it twice is the same as running it once.
pub fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}

/// Split a comma separated header value into trimmed, non-empty tokens.
pub fn split_comma_separated(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// All comma separated tokens of every instance of `name`, in arrival order.
pub fn comma_separated_values(headers: &HeaderMap, name: &HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(split_comma_separated)
        .collect()
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    comma_separated_values(headers, name)
        .iter()
        .any(|value| value.eq_ignore_ascii_case(token))
}

/// Remove the headers named by `Connection` tokens, except `Transfer-Encoding`.
pub fn strip_connection_tokens(headers: &mut HeaderMap) {
    for token in comma_separated_values(headers, &CONNECTION) {
        if token.eq_ignore_ascii_case(TRANSFER_ENCODING.as_str()) {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(token.to_ascii_lowercase().as_bytes()) {
            headers.remove(&name);
        }
    }
}

/// Fold `Proxy-Connection` into `Connection`.
pub fn switch_proxy_connection_header(headers: &mut HeaderMap) {
    if let Some(value) = headers.remove(PROXY_CONNECTION) {
        headers.insert(CONNECTION, value);
    }
}

/// Drop `sdch` from `Accept-Encoding`; the proxy cannot decode it.
pub fn remove_sdch_encoding(headers: &mut HeaderMap) {
    let encodings: Vec<String> = headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();
    if encodings.is_empty() {
        return;
    }

    headers.remove(ACCEPT_ENCODING);
    for encoding in encodings {
        let kept: Vec<String> = split_comma_separated(&encoding)
            .into_iter()
            .filter(|token| !token.eq_ignore_ascii_case("sdch"))
            .collect();
        if kept.is_empty() {
            continue;
        }
        if let Ok(value) = HeaderValue::from_str(&kept.join(", ")) {
            headers.append(ACCEPT_ENCODING, value);
        }
    }
}

/// `Via` token for a message of `version` passing through `alias`, e.g. `1.1 proxy-host`.
pub fn via_token(version: Version, alias: &str) -> String {
    let (major, minor) = version_numbers(version);
    format!("{}.{} {}", major, minor, alias)
}

/// Append this proxy's `Via` token after any existing `Via` values.
pub fn add_via(headers: &mut HeaderMap, version: Version, alias: &str) {
    match HeaderValue::from_str(&via_token(version, alias)) {
        Ok(value) => headers.append(VIA, value),
        Err(e) => {
            debug!("Not adding Via for alias {:?}: {}", alias, e);
            false
        }
    };
}

fn version_numbers(version: Version) -> (u8, u8) {
    match version {
        Version::HTTP_09 => (0, 9),
        Version::HTTP_10 => (1, 0),
        Version::HTTP_2 => (2, 0),
        Version::HTTP_3 => (3, 0),
        _ => (1, 1),
    }
}

/// Keep-alive as declared by a message: HTTP/1.1 persists unless `Connection: close`,
/// HTTP/1.0 closes unless `Connection: keep-alive`.
pub fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    if has_token(headers, &CONNECTION, "close") {
        return false;
    }
    if version == Version::HTTP_10 || version == Version::HTTP_09 {
        return has_token(headers, &CONNECTION, "keep-alive");
    }
    true
}

pub fn is_request_keep_alive(request: &HttpRequest) -> bool {
    is_keep_alive(request.version, &request.headers)
}

pub fn is_response_keep_alive(response: &HttpResponse) -> bool {
    is_keep_alive(response.version, &response.headers)
}

/// Rewrite `Connection` so the message declares `keep_alive` for its version.
pub fn set_keep_alive(version: Version, headers: &mut HeaderMap, keep_alive: bool) {
    let http10 = version == Version::HTTP_10 || version == Version::HTTP_09;
    match (http10, keep_alive) {
        (false, true) => {
            headers.remove(CONNECTION);
        }
        (false, false) => {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
        (true, true) => {
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }
        (true, false) => {
            headers.remove(CONNECTION);
        }
    }
}

/// True for the object that ends a message: a last chunk or a full message.
pub fn is_last_chunk(object: &HttpObject) -> bool {
    match object {
        HttpObject::Content(content) => content.last,
        HttpObject::Request(request) => request.body.is_some(),
        HttpObject::Response(response) => response.body.is_some(),
    }
}

/// True while more body chunks are expected after `object`.
pub fn is_chunked(object: &HttpObject) -> bool {
    !is_last_chunk(object)
}

/// Whether the final transfer coding is `chunked`.
pub fn is_transfer_encoding_chunked(headers: &HeaderMap) -> bool {
    comma_separated_values(headers, &TRANSFER_ENCODING)
        .last()
        .map(|coding| coding.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Make `chunked` the final transfer coding, keeping any codings already
/// applied, and drop `Content-Length`.
pub fn set_transfer_encoding_chunked(headers: &mut HeaderMap) {
    headers.remove(CONTENT_LENGTH);
    let mut codings: Vec<String> = comma_separated_values(headers, &TRANSFER_ENCODING)
        .into_iter()
        .filter(|coding| !coding.eq_ignore_ascii_case("chunked"))
        .collect();
    if codings.is_empty() {
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        return;
    }
    codings.push("chunked".to_string());
    match HeaderValue::from_str(&codings.join(", ")) {
        Ok(value) => {
            headers.insert(TRANSFER_ENCODING, value);
        }
        Err(_) => {
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
    }
}

/// Parsed `Content-Length`.
///
/// Repeated headers or list values are accepted only when they all agree;
/// anything that is not a plain decimal number is a parse error.
pub fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let value = value
            .to_str()
            .map_err(|_| Error::Parse("non-ASCII Content-Length".to_string()))?;
        for item in value.split(',').map(str::trim) {
            if item.is_empty() || !item.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::Parse(format!("invalid Content-Length {:?}", value)));
            }
            let parsed: u64 = item
                .parse()
                .map_err(|_| Error::Parse(format!("Content-Length {} is too large", item)))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(Error::Parse(format!(
                        "conflicting Content-Length values {} and {}",
                        existing, parsed
                    )));
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

/// Responses that never carry a body: 1xx, 204, 205 and 304.
pub fn is_content_always_empty(status: StatusCode) -> bool {
    status.is_informational()
        || matches!(
            status,
            StatusCode::NO_CONTENT | StatusCode::RESET_CONTENT | StatusCode::NOT_MODIFIED
        )
}

/// Whether a response delimits its own body instead of relying on connection close.
pub fn is_response_self_terminating(response: &HttpResponse) -> bool {
    if is_content_always_empty(response.status) {
        return true;
    }
    if response.headers.contains_key(TRANSFER_ENCODING) {
        return is_transfer_encoding_chunked(&response.headers);
    }
    response
        .headers
        .get(CONTENT_LENGTH)
        .map(|value| !value.is_empty())
        .unwrap_or(false)
}

pub fn is_switching_protocols(response: &HttpResponse) -> bool {
    response.status == StatusCode::SWITCHING_PROTOCOLS
}

fn scheme_len(uri: &str) -> Option<usize> {
    let lower = uri.get(..8).unwrap_or(uri).to_ascii_lowercase();
    if lower.starts_with("http://") {
        Some(7)
    } else if lower.starts_with("https://") {
        Some(8)
    } else {
        None
    }
}

/// Whether the request target is in absolute form (`http://host/...`).
pub fn is_absolute_uri(uri: &str) -> bool {
    scheme_len(uri).is_some()
}

/// `host[:port]` named by a request target: absolute form or CONNECT authority form.
pub fn parse_host_and_port(uri: &str) -> String {
    let rest = match scheme_len(uri) {
        Some(len) => &uri[len..],
        None => uri,
    };
    match rest.find('/') {
        Some(slash) => rest[..slash].to_string(),
        None => rest.to_string(),
    }
}

/// Destination of a request: the request target first, then the first `Host` header.
pub fn identify_host_and_port(request: &HttpRequest) -> Option<String> {
    let from_uri = parse_host_and_port(&request.uri);
    let host_and_port = if from_uri.trim().is_empty() || from_uri.starts_with('*') {
        request
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default()
    } else {
        from_uri
    };

    let host_and_port = host_and_port.trim().to_string();
    if host_and_port.is_empty() {
        None
    } else {
        Some(host_and_port)
    }
}

/// Split `host[:port]` (IPv6 literals in brackets) falling back to `default_port`.
pub fn split_host_and_port(host_and_port: &str, default_port: u16) -> Option<(String, u16)> {
    let host_and_port = host_and_port.trim();
    if host_and_port.is_empty() {
        return None;
    }

    if let Some(rest) = host_and_port.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let port = match rest[close + 1..].strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }

    match host_and_port.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            Some((host.to_string(), port.parse().ok()?))
        }
        Some(_) => Some((host_and_port.to_string(), default_port)),
        None => Some((host_and_port.to_string(), default_port)),
    }
}

/// Turn `http://host.com/path` into `/path`; other targets are returned unchanged.
pub fn strip_host(uri: &str) -> String {
    let Some(len) = scheme_len(uri) else {
        return uri.to_string();
    };
    let rest = &uri[len..];
    match rest.find('/') {
        Some(slash) => rest[slash..].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Method;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_hop_by_hop_is_case_insensitive() {
        assert!(is_hop_by_hop_header("Proxy-Authorization"));
        assert!(is_hop_by_hop_header("KEEP-ALIVE"));
        assert!(is_hop_by_hop_header("Trailer"));
        assert!(!is_hop_by_hop_header("Transfer-Encoding"));
        assert!(!is_hop_by_hop_header("Content-Type"));
    }

    #[test]
    fn test_strip_hop_by_hop_is_idempotent() {
        let mut once = headers(&[
            ("connection", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("te", "trailers"),
            ("upgrade", "websocket"),
            ("content-type", "text/plain"),
            ("transfer-encoding", "chunked"),
        ]);
        strip_hop_by_hop_headers(&mut once);
        let mut twice = once.clone();
        strip_hop_by_hop_headers(&mut twice);

        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
        assert!(once.contains_key("content-type"));
        assert!(once.contains_key("transfer-encoding"));
    }

    #[test]
    fn test_strip_connection_tokens_keeps_transfer_encoding() {
        let mut map = headers(&[
            ("connection", "X-Secret, Transfer-Encoding"),
            ("x-secret", "1"),
            ("transfer-encoding", "chunked"),
        ]);
        strip_connection_tokens(&mut map);
        assert!(!map.contains_key("x-secret"));
        assert!(map.contains_key("transfer-encoding"));
    }

    #[test]
    fn test_switch_proxy_connection_header() {
        let mut map = headers(&[("proxy-connection", "close")]);
        switch_proxy_connection_header(&mut map);
        assert_eq!(map.get(CONNECTION).unwrap(), "close");
        assert!(!map.contains_key(PROXY_CONNECTION));
    }

    #[test]
    fn test_remove_sdch_encoding() {
        let mut map = headers(&[("accept-encoding", "sdch, gzip, deflate")]);
        remove_sdch_encoding(&mut map);
        assert_eq!(map.get(ACCEPT_ENCODING).unwrap(), "gzip, deflate");

        let mut only_sdch = headers(&[("accept-encoding", "SDCH")]);
        remove_sdch_encoding(&mut only_sdch);
        assert!(!only_sdch.contains_key(ACCEPT_ENCODING));
    }

    #[test]
    fn test_add_via_appends() {
        let mut map = headers(&[("via", "1.0 upstream")]);
        add_via(&mut map, Version::HTTP_11, "edge");
        let vias: Vec<_> = map.get_all(VIA).iter().collect();
        assert_eq!(vias, vec!["1.0 upstream", "1.1 edge"]);
    }

    #[test]
    fn test_keep_alive_defaults_by_version() {
        assert!(is_keep_alive(Version::HTTP_11, &HeaderMap::new()));
        assert!(!is_keep_alive(Version::HTTP_10, &HeaderMap::new()));
        assert!(!is_keep_alive(Version::HTTP_11, &headers(&[("connection", "Close")])));
        assert!(is_keep_alive(
            Version::HTTP_10,
            &headers(&[("connection", "Keep-Alive")])
        ));
    }

    #[test]
    fn test_set_keep_alive_round_trips() {
        let mut map = HeaderMap::new();
        set_keep_alive(Version::HTTP_11, &mut map, false);
        assert!(!is_keep_alive(Version::HTTP_11, &map));
        set_keep_alive(Version::HTTP_11, &mut map, true);
        assert!(is_keep_alive(Version::HTTP_11, &map));
        set_keep_alive(Version::HTTP_10, &mut map, true);
        assert!(is_keep_alive(Version::HTTP_10, &map));
    }

    #[test]
    fn test_last_chunk_detection() {
        use crate::models::HttpContent;
        let head = HttpObject::Request(HttpRequest::new(Method::GET, "/", Version::HTTP_11));
        assert!(is_chunked(&head));
        assert!(!is_last_chunk(&HttpObject::Content(HttpContent::chunk("a"))));
        assert!(is_last_chunk(&HttpObject::Content(HttpContent::empty_last())));

        let mut full = HttpResponse::new(Version::HTTP_11, StatusCode::OK);
        full.body = Some(Bytes::new());
        assert!(is_last_chunk(&HttpObject::Response(full)));
    }

    #[test]
    fn test_response_self_termination() {
        let mut response = HttpResponse::new(Version::HTTP_11, StatusCode::OK);
        assert!(!is_response_self_terminating(&response));

        response.headers = headers(&[("content-length", "10")]);
        assert!(is_response_self_terminating(&response));

        response.headers = headers(&[("transfer-encoding", "gzip"), ("content-length", "10")]);
        assert!(!is_response_self_terminating(&response));

        response.headers = headers(&[("transfer-encoding", "gzip, chunked")]);
        assert!(is_response_self_terminating(&response));

        let not_modified = HttpResponse::new(Version::HTTP_11, StatusCode::NOT_MODIFIED);
        assert!(is_response_self_terminating(&not_modified));
    }

    #[test]
    fn test_content_length_values() {
        assert_eq!(content_length(&HeaderMap::new()).unwrap(), None);
        assert_eq!(content_length(&headers(&[("content-length", " 42 ")])).unwrap(), Some(42));
        assert_eq!(
            content_length(&headers(&[("content-length", "7"), ("content-length", "7")])).unwrap(),
            Some(7)
        );
        assert_eq!(content_length(&headers(&[("content-length", "7, 7")])).unwrap(), Some(7));

        for bad in ["abc", "-1", "+5", "1.5", "", "99999999999999999999999"] {
            let err = content_length(&headers(&[("content-length", bad)])).unwrap_err();
            assert!(matches!(err, Error::Parse(_)), "{:?} accepted", bad);
        }
        assert!(content_length(&headers(&[("content-length", "5"), ("content-length", "6")])).is_err());
        assert!(content_length(&headers(&[("content-length", "5, 6")])).is_err());
    }

    #[test]
    fn test_chunked_is_appended_to_existing_codings() {
        let mut map = headers(&[("transfer-encoding", "gzip"), ("content-length", "10")]);
        set_transfer_encoding_chunked(&mut map);
        assert_eq!(map.get(TRANSFER_ENCODING).unwrap(), "gzip, chunked");
        assert!(map.get(CONTENT_LENGTH).is_none());
        assert!(is_transfer_encoding_chunked(&map));

        let mut map = headers(&[("transfer-encoding", "gzip, chunked")]);
        set_transfer_encoding_chunked(&mut map);
        assert_eq!(map.get(TRANSFER_ENCODING).unwrap(), "gzip, chunked");

        let mut map = HeaderMap::new();
        set_transfer_encoding_chunked(&mut map);
        assert_eq!(map.get(TRANSFER_ENCODING).unwrap(), "chunked");
    }

    #[test]
    fn test_parse_host_and_port() {
        assert_eq!(parse_host_and_port("http://example.com:8080/a/b"), "example.com:8080");
        assert_eq!(parse_host_and_port("HTTPS://example.com"), "example.com");
        assert_eq!(parse_host_and_port("example.com:443"), "example.com:443");
        assert_eq!(parse_host_and_port("/relative"), "");
    }

    #[test]
    fn test_identify_host_falls_back_to_host_header() {
        let mut request = HttpRequest::new(Method::GET, "/index.html", Version::HTTP_11);
        assert_eq!(identify_host_and_port(&request), None);

        request.headers = headers(&[("HOST", "example.org:81")]);
        assert_eq!(identify_host_and_port(&request).as_deref(), Some("example.org:81"));

        request.uri = "http://other.net/".to_string();
        assert_eq!(identify_host_and_port(&request).as_deref(), Some("other.net"));
    }

    #[test]
    fn test_split_host_and_port() {
        assert_eq!(split_host_and_port("example.com", 80), Some(("example.com".into(), 80)));
        assert_eq!(split_host_and_port("example.com:8443", 80), Some(("example.com".into(), 8443)));
        assert_eq!(split_host_and_port("[::1]:9000", 80), Some(("::1".into(), 9000)));
        assert_eq!(split_host_and_port("[::1]", 443), Some(("::1".into(), 443)));
        assert_eq!(split_host_and_port("example.com:http", 80), None);
        assert_eq!(split_host_and_port("  ", 80), None);
    }

    #[test]
    fn test_strip_host() {
        assert_eq!(strip_host("http://example.com/path?q=1"), "/path?q=1");
        assert_eq!(strip_host("http://example.com"), "/");
        assert_eq!(strip_host("/already/relative"), "/already/relative");
    }
}
