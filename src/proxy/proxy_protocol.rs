//! HAProxy PROXY protocol, version 1 (text form)
//!
//! `PROXY TCP4 <src> <dst> <srcport> <dstport>\r\n`, with `TCP6` for IPv6
//! and `PROXY UNKNOWN\r\n` when the addresses are not known.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest legal v1 header, CRLF included
pub const MAX_HEADER_LENGTH: usize = 107;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocolHeader {
    Tcp {
        source: SocketAddr,
        destination: SocketAddr,
    },
    Unknown,
}

impl ProxyProtocolHeader {
    pub fn from_addrs(source: SocketAddr, destination: SocketAddr) -> Self {
        if source.is_ipv4() == destination.is_ipv4() {
            ProxyProtocolHeader::Tcp {
                source,
                destination,
            }
        } else {
            ProxyProtocolHeader::Unknown
        }
    }

    pub fn source(&self) -> Option<SocketAddr> {
        match self {
            ProxyProtocolHeader::Tcp { source, .. } => Some(*source),
            ProxyProtocolHeader::Unknown => None,
        }
    }

    /// Parse one header line, with or without its trailing CRLF.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches("\r\n");
        let mut parts = line.split(' ');
        if parts.next() != Some("PROXY") {
            return Err(Error::Parse("missing PROXY signature".to_string()));
        }

        let family = parts.next().unwrap_or_default();
        if family == "UNKNOWN" {
            return Ok(ProxyProtocolHeader::Unknown);
        }
        if family != "TCP4" && family != "TCP6" {
            return Err(Error::Parse(format!("unsupported PROXY family {:?}", family)));
        }

        let fields: Vec<&str> = parts.collect();
        let [src, dst, src_port, dst_port] = fields.as_slice() else {
            return Err(Error::Parse(format!("malformed PROXY header {:?}", line)));
        };
        let parse_ip = |ip: &str| -> Result<IpAddr> {
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| Error::Parse(format!("invalid PROXY address {:?}", ip)))?;
            if ip.is_ipv4() != (family == "TCP4") {
                return Err(Error::Parse(format!("{} address in a {} header", ip, family)));
            }
            Ok(ip)
        };
        let parse_port = |port: &str| -> Result<u16> {
            port.parse()
                .map_err(|_| Error::Parse(format!("invalid PROXY port {:?}", port)))
        };

        Ok(ProxyProtocolHeader::Tcp {
            source: SocketAddr::new(parse_ip(*src)?, parse_port(*src_port)?),
            destination: SocketAddr::new(parse_ip(*dst)?, parse_port(*dst_port)?),
        })
    }

    pub fn encode(&self) -> Bytes {
        let line = match self {
            ProxyProtocolHeader::Tcp {
                source,
                destination,
            } => format!(
                "PROXY {} {} {} {} {}\r\n",
                if source.is_ipv4() { "TCP4" } else { "TCP6" },
                source.ip(),
                destination.ip(),
                source.port(),
                destination.port()
            ),
            ProxyProtocolHeader::Unknown => "PROXY UNKNOWN\r\n".to_string(),
        };
        Bytes::from(line)
    }
}

/// Read the header from the start of `stream`. Bytes read past it are
/// returned so they can be replayed to the HTTP decoder.
pub async fn read_header<S>(stream: &mut S) -> Result<(ProxyProtocolHeader, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(MAX_HEADER_LENGTH * 2);
    loop {
        if let Some(end) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(end + 2);
            let line = std::str::from_utf8(&line)
                .map_err(|_| Error::Parse("PROXY header is not ASCII".to_string()))?;
            let header = ProxyProtocolHeader::parse(line)?;
            return Ok((header, buf.freeze()));
        }
        if buf.len() >= MAX_HEADER_LENGTH {
            return Err(Error::Parse("PROXY header too long".to_string()));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::Closed("eof before PROXY header".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_tcp4_and_encode() {
        let header = ProxyProtocolHeader::parse("PROXY TCP4 192.168.0.1 10.0.0.2 56324 443\r\n").unwrap();
        assert_eq!(header.source(), Some("192.168.0.1:56324".parse().unwrap()));
        assert_eq!(
            &header.encode()[..],
            b"PROXY TCP4 192.168.0.1 10.0.0.2 56324 443\r\n"
        );
    }

    #[test]
    fn test_parse_tcp6_and_unknown() {
        let header = ProxyProtocolHeader::parse("PROXY TCP6 ::1 2001:db8::1 1000 80").unwrap();
        assert_eq!(header.source(), Some("[::1]:1000".parse().unwrap()));
        assert_eq!(
            ProxyProtocolHeader::parse("PROXY UNKNOWN\r\n").unwrap(),
            ProxyProtocolHeader::Unknown
        );
    }

    #[test]
    fn test_rejects_mismatched_family() {
        assert!(ProxyProtocolHeader::parse("PROXY TCP4 ::1 ::1 1 2").is_err());
        assert!(ProxyProtocolHeader::parse("PROXY TCP4 1.1.1.1 2.2.2.2 1").is_err());
        assert!(ProxyProtocolHeader::parse("GET / HTTP/1.1").is_err());
    }

    #[tokio::test]
    async fn test_read_header_keeps_leftover() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        theirs
            .write_all(b"PROXY TCP4 1.2.3.4 5.6.7.8 1111 80\r\nGET / HTTP/1.1\r\n")
            .await
            .unwrap();
        let (header, leftover) = read_header(&mut ours).await.unwrap();
        assert_eq!(header.source(), Some("1.2.3.4:1111".parse().unwrap()));
        assert_eq!(&leftover[..], b"GET / HTTP/1.1\r\n");
    }
}
