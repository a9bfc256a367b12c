//! Certificate authority abstraction and PEM helpers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;

use crate::CertError;

/// Key and chain returned by a certificate authority
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub private_key_pem: String,
    pub certificate_chain_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// External service that issues certificates for a single domain
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn obtain(&self, domain: &str) -> Result<IssuedCertificate, CertError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Read the `notAfter` of the first (leaf) certificate in a PEM chain
pub fn parse_expiry(chain_pem: &str) -> Result<DateTime<Utc>, CertError> {
    let leaf = parse_chain(chain_pem)?
        .into_iter()
        .next()
        .ok_or_else(|| CertError::InvalidCertificate("empty certificate chain".to_string()))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| CertError::InvalidCertificate(format!("unparseable leaf: {}", e)))?;

    let not_after = cert.validity().not_after.timestamp();
    DateTime::<Utc>::from_timestamp(not_after, 0)
        .ok_or_else(|| CertError::InvalidCertificate("expiry out of range".to_string()))
}

/// Build a rustls `CertifiedKey` from PEM chain and key
pub fn certified_key_from_pem(
    chain_pem: &str,
    key_pem: &str,
) -> Result<Arc<CertifiedKey>, CertError> {
    let chain = parse_chain(chain_pem)?;
    if chain.is_empty() {
        return Err(CertError::InvalidCertificate(
            "empty certificate chain".to_string(),
        ));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| CertError::InvalidCertificate(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| CertError::InvalidCertificate("No private key found".to_string()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::InvalidCertificate(format!("Unsupported key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

fn parse_chain(chain_pem: &str) -> Result<Vec<CertificateDer<'static>>, CertError> {
    rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::InvalidCertificate(format!("Failed to parse certs: {}", e)))
}
