//! Certificate generation for TLS interception
//!
//! A [`CertificateAuthority`] is either loaded from PEM files or generated in
//! memory, then signs one leaf certificate per intercepted host.

use crate::config::MitmConfig;
use anyhow::{anyhow, Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::{Certificate as RustlsCertificate, PrivateKey};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Leaf certificate, its private key and the issuing CA certificate
#[derive(Debug, Clone)]
pub struct CertificateData {
    pub cert: RustlsCertificate,
    pub key: PrivateKey,
    pub issuer: RustlsCertificate,
}

impl CertificateData {
    /// Leaf first, then the CA
    pub fn chain(&self) -> Vec<RustlsCertificate> {
        vec![self.cert.clone(), self.issuer.clone()]
    }
}

pub struct CertificateAuthority {
    signer: Certificate,
    der: RustlsCertificate,
    /// The same certificate as `der`; re-serializing would re-sign it
    pem: String,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA
    pub fn generate(organization: &str, validity_days: u32) -> Result<Self> {
        let common_name = format!("{} CA", organization);
        info!("📜 Generating interception CA \"{}\"", common_name);

        let mut params = CertificateParams::new(Vec::new());
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::OrganizationName, organization);
        distinguished_name.push(DnType::CommonName, common_name.as_str());
        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, validity_days);

        let signer = Certificate::from_params(params)
            .map_err(|e| anyhow!("Failed to generate CA certificate: {}", e))?;
        let pem = signer.serialize_pem()?;
        let der = first_certificate(&pem)?;
        Ok(Self {
            signer,
            der: RustlsCertificate(der),
            pem,
        })
    }

    /// Load a CA from PEM encoded certificate and private key files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        debug!("Loading CA from {} and {}", cert_path.display(), key_path.display());

        let cert_pem = fs::read_to_string(cert_path)
            .with_context(|| format!("Failed to read CA certificate {}", cert_path.display()))?;
        let key_pem = fs::read_to_string(key_path)
            .with_context(|| format!("Failed to read CA key {}", key_path.display()))?;

        let der = first_certificate(&cert_pem)
            .with_context(|| format!("No CA certificate in {}", cert_path.display()))?;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| anyhow!("Invalid CA key {}: {}", key_path.display(), e))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| anyhow!("Invalid CA certificate {}: {}", cert_path.display(), e))?;
        let signer = Certificate::from_params(params)
            .map_err(|e| anyhow!("Failed to rebuild CA signer: {}", e))?;

        info!("📜 Loaded interception CA from {}", cert_path.display());
        Ok(Self {
            signer,
            der: RustlsCertificate(der),
            pem: cert_pem,
        })
    }

    /// Use the configured CA files, creating them on first start; without
    /// paths the CA only lives in memory.
    pub fn load_or_generate(config: &MitmConfig) -> Result<Self> {
        match (&config.ca_cert_path, &config.ca_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let (cert_path, key_path) = (Path::new(cert_path), Path::new(key_path));
                if cert_path.exists() && key_path.exists() {
                    return Self::load(cert_path, key_path);
                }
                let ca = Self::generate(&config.organization, config.validity_days)?;
                ca.save(cert_path, key_path)?;
                Ok(ca)
            }
            _ => Self::generate(&config.organization, config.validity_days),
        }
    }

    /// Write the CA as PEM so clients can be told to trust it
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        fs::write(cert_path, &self.pem)
            .with_context(|| format!("Failed to write {}", cert_path.display()))?;
        fs::write(key_path, self.signer.serialize_private_key_pem())
            .with_context(|| format!("Failed to write {}", key_path.display()))?;

        info!("💾 Saved CA certificate to {}", cert_path.display());
        Ok(())
    }

    pub fn certificate(&self) -> &RustlsCertificate {
        &self.der
    }

    /// Sign a server certificate for `host` (DNS name or IP literal)
    pub fn issue(&self, host: &str, validity_days: u32) -> Result<CertificateData> {
        debug!("Issuing certificate for {}", host);

        let mut params = CertificateParams::new(Vec::new());
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, host);
        params.distinguished_name = distinguished_name;
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(host.to_string())],
        };
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut params, validity_days);

        let leaf = Certificate::from_params(params)
            .map_err(|e| anyhow!("Failed to generate certificate for {}: {}", host, e))?;
        let cert = RustlsCertificate(leaf.serialize_der_with_signer(&self.signer)?);
        let key = PrivateKey(leaf.serialize_private_key_der());

        Ok(CertificateData {
            cert,
            key,
            issuer: self.der.clone(),
        })
    }
}

fn first_certificate(pem: &str) -> Result<Vec<u8>> {
    rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .context("Invalid certificate PEM")?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No certificate in PEM input"))
}

fn set_validity(params: &mut CertificateParams, validity_days: u32) {
    let now = SystemTime::now();
    // Backdated a day to tolerate client clock skew
    params.not_before = (now - ONE_DAY).into();
    params.not_after = (now + ONE_DAY * validity_days.max(1)).into();
}
