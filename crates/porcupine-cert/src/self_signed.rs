//! Self-signed certificate generation for development and testing
//!
//! Used for the relay's QUIC identity when no certificate is configured, and
//! as a stand-in certificate authority when ACME is disabled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use tracing::info;

use crate::authority::{CertificateAuthority, IssuedCertificate};
use crate::CertError;

const DEFAULT_VALIDITY_DAYS: i64 = 90;

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format
    pub cert_der: Vec<u8>,

    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key (PKCS#8) in PEM format
    pub pem_key: String,

    pub expires_at: DateTime<Utc>,
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files, creating parent directories
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> std::io::Result<()> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}

/// Certificate valid for localhost, 127.0.0.1 and ::1
pub fn generate_self_signed_cert() -> Result<SelfSignedCertificate, CertError> {
    generate_self_signed_cert_with_domains(
        &["localhost".to_string(), "*.localhost".to_string()],
        DEFAULT_VALIDITY_DAYS,
    )
}

/// Certificate for the given DNS names (plus loopback addresses)
pub fn generate_self_signed_cert_with_domains(
    domains: &[String],
    validity_days: i64,
) -> Result<SelfSignedCertificate, CertError> {
    let gen_err = |e: rcgen::Error| CertError::IssuanceFailed {
        domain: domains.join(","),
        reason: e.to_string(),
    };

    let mut params = CertificateParams::new(domains.to_vec()).map_err(gen_err)?;

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        domains.first().map(String::as_str).unwrap_or("localhost"),
    );
    dn.push(DnType::OrganizationName, "Porcupine Dev");
    params.distinguished_name = dn;

    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::minutes(5);
    params.not_after = now + time::Duration::days(validity_days);
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let not_after = params.not_after;

    let key_pair = KeyPair::generate().map_err(gen_err)?;
    let cert = params.self_signed(&key_pair).map_err(gen_err)?;

    let expires_at = DateTime::<Utc>::from_timestamp(not_after.unix_timestamp(), 0)
        .ok_or_else(|| CertError::InvalidCertificate("expiry out of range".to_string()))?;

    Ok(SelfSignedCertificate {
        cert_der: cert.der().to_vec(),
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
        expires_at,
    })
}

/// Certificate authority that signs its own certificates
///
/// Browsers will not trust these. Intended for local development and tests.
#[derive(Debug, Clone)]
pub struct SelfSignedAuthority {
    validity_days: i64,
}

impl SelfSignedAuthority {
    pub fn new() -> Self {
        Self {
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }

    pub fn with_validity_days(mut self, days: i64) -> Self {
        self.validity_days = days;
        self
    }
}

impl Default for SelfSignedAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertificateAuthority for SelfSignedAuthority {
    async fn obtain(&self, domain: &str) -> Result<IssuedCertificate, CertError> {
        let domains = vec![domain.to_string()];
        let validity_days = self.validity_days;

        // Key generation is CPU bound
        let cert = tokio::task::spawn_blocking(move || {
            generate_self_signed_cert_with_domains(&domains, validity_days)
        })
        .await
        .map_err(|e| CertError::IssuanceFailed {
            domain: domain.to_string(),
            reason: e.to_string(),
        })??;

        info!(domain, expires_at = %cert.expires_at, "Issued self-signed certificate");

        Ok(IssuedCertificate {
            private_key_pem: cert.pem_key,
            certificate_chain_pem: cert.pem_cert,
            expires_at: cert.expires_at,
        })
    }

    fn name(&self) -> &'static str {
        "self-signed"
    }
}
