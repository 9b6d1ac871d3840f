//! TLS configuration utilities

use anyhow::{anyhow, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Create rustls ServerConfig presenting `cert_chain` to clients
pub fn create_server_config(
    cert_chain: Vec<Certificate>,
    key: PrivateKey,
) -> Result<Arc<ServerConfig>> {
    debug!("Creating TLS server configuration");

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| anyhow!("Failed to create TLS server config: {}", e))?;

    // Only HTTP/1.x is spoken inside intercepted tunnels
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Create rustls ClientConfig for upstream connections
///
/// Trusts the native root store plus `extra_roots`, or nothing at all when
/// `skip_verify` is set.
pub fn create_client_config(extra_roots: &[Certificate], skip_verify: bool) -> Result<Arc<ClientConfig>> {
    debug!("Creating TLS client configuration");

    let mut config = if skip_verify {
        warn!("⚠️  WARNING: Skipping upstream certificate verification (insecure)");
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAllCertVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        add_system_root_certificates(&mut root_store);
        for cert in extra_roots {
            root_store
                .add(cert)
                .map_err(|e| anyhow!("Failed to add root certificate: {:?}", e))?;
        }
        ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    info!("✅ TLS client configuration created");
    info!("   Certificate verification: {}", !skip_verify);

    Ok(Arc::new(config))
}

/// Add system root certificates to the root store
fn add_system_root_certificates(root_store: &mut RootCertStore) {
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let mut added = 0;
            let mut failed = 0;

            for cert_der in certs {
                let cert = Certificate(cert_der.to_vec());
                match root_store.add(&cert) {
                    Ok(_) => added += 1,
                    Err(_) => failed += 1,
                }
            }

            debug!("Root certificate store: {} added, {} rejected", added, failed);
        }
        Err(e) => {
            // Environments without a system store still get the explicit roots
            info!("⚠️  Could not load system root certificates: {}", e);
        }
    }
}

/// Certificate verifier that accepts every upstream certificate
pub struct AcceptAllCertVerifier;

impl ServerCertVerifier for AcceptAllCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
