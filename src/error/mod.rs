//! Error handling module for the proxy core

use thiserror::Error;
use tokio::time::error::Elapsed;

/// Custom error type for the proxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("HTTP parse error: {0}")]
    Parse(String),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unable to resolve {0}")]
    Resolution(String),

    #[error("Connection to {0} failed: {1}")]
    Connect(String, String),

    #[error("Chained proxy refused CONNECT with status {0}")]
    ChainedProxyRefused(u16),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Timeout error: {0}")]
    Timeout(#[from] Elapsed),
}

/// Result type for the proxy
pub type Result<T> = std::result::Result<T, Error>;

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Whether this error is the ordinary end of a socket rather than a fault.
    ///
    /// Resets, aborted connections and broken pipes happen whenever a browser
    /// gives up on a request, so they are logged quietly.
    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            Error::Closed(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_is_expected_disconnect() {
        let err = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(err.is_expected_disconnect());

        let err = Error::Resolution("nowhere:80".to_string());
        assert!(!err.is_expected_disconnect());
    }

    #[test]
    fn test_parse_error_message() {
        let err = Error::from(httparse::Error::Token);
        assert!(err.to_string().starts_with("HTTP parse error"));
    }
}
