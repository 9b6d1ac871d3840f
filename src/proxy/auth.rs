//! Proxy authentication (Basic)

use crate::config::AuthConfig;
use base64::{engine::general_purpose, Engine as _};
use http::HeaderMap;
use http::header::PROXY_AUTHORIZATION;

pub trait ProxyAuthenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;

    /// Realm advertised in the 407 challenge
    fn realm(&self) -> &str;
}

/// Single username/password pair from the configuration
#[derive(Debug, Clone)]
pub struct StaticProxyAuthenticator {
    username: String,
    password: String,
    realm: String,
}

impl StaticProxyAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            realm: realm.into(),
        }
    }

    /// `None` unless authentication is enabled.
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        config.enabled.then(|| {
            Self::new(config.username.clone(), config.password.clone(), config.realm.clone())
        })
    }
}

impl ProxyAuthenticator for StaticProxyAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }

    fn realm(&self) -> &str {
        &self.realm
    }
}

/// Username and password from a `Proxy-Authorization: Basic ...` header.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(PROXY_AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}
