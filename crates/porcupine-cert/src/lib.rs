//! Certificate management with ACME support
//!
//! Issues TLS certificates per hostname on demand, caches them, retries
//! failures with bounded backoff and renews them ahead of expiry.

pub mod acme;
pub mod authority;
pub mod challenge;
pub mod manager;
pub mod self_signed;
pub mod storage;

pub use acme::{AcmeAuthority, AcmeConfig};
pub use authority::{certified_key_from_pem, parse_expiry, CertificateAuthority, IssuedCertificate};
pub use challenge::Http01ChallengeStore;
pub use manager::{CertManagerConfig, CertStatus, CertificateManager, RenewalReport};
pub use self_signed::{
    generate_self_signed_cert, generate_self_signed_cert_with_domains, SelfSignedAuthority,
    SelfSignedCertificate,
};
pub use storage::CertificateStore;

use std::time::Duration;
use thiserror::Error;

/// Certificate errors
///
/// Cloneable so one failed issuance can be reported to every caller that
/// joined it.
#[derive(Debug, Clone, Error)]
pub enum CertError {
    #[error("Certificate issuance failed for {domain}: {reason}")]
    IssuanceFailed { domain: String, reason: String },

    #[error("Certificate issuance for {domain} is backing off for {retry_in:?}")]
    Backoff { domain: String, retry_in: Duration },

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("ACME error: {0}")]
    Acme(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CertError {
    /// Whether this error belongs to the issuance failure class
    pub fn is_issuance_failure(&self) -> bool {
        matches!(self, CertError::IssuanceFailed { .. } | CertError::Backoff { .. })
    }
}
