//! QUIC transport configuration

use porcupine_transport::{
    TransportConfig, TransportError, TransportResult, TransportSecurityConfig,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    security: TransportSecurityConfig,

    /// Server certificate chain (PEM), servers only
    pub server_cert_path: Option<PathBuf>,

    /// Server private key (PEM), servers only
    pub server_key_path: Option<PathBuf>,

    pub keep_alive_interval: Duration,

    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the peer may open
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    /// Client configuration verifying the relay against the webpki roots
    pub fn client_default() -> Self {
        Self {
            security: TransportSecurityConfig::default(),
            server_cert_path: None,
            server_key_path: None,
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(30),
            max_concurrent_streams: 1000,
        }
    }

    /// Client configuration that skips certificate verification
    ///
    /// **INSECURE**: only for a relay running a self-signed host identity in
    /// development. Anyone on the path can impersonate the relay.
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Server configuration from PEM certificate and key paths
    pub fn server_default(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> TransportResult<Self> {
        Ok(Self {
            security: TransportSecurityConfig::default(),
            server_cert_path: Some(cert_path.as_ref().to_path_buf()),
            server_key_path: Some(key_path.as_ref().to_path_buf()),
            keep_alive_interval: Duration::from_secs(3),
            max_idle_timeout: Duration::from_secs(30),
            max_concurrent_streams: 1000,
        })
    }

    /// Server configuration with a throwaway self-signed certificate
    ///
    /// Files land in the temp directory under a random name so parallel tests
    /// never share one.
    #[doc(hidden)]
    pub fn server_ephemeral() -> TransportResult<Self> {
        let cert = porcupine_cert::generate_self_signed_cert().map_err(|e| {
            TransportError::TlsError(format!("Failed to generate self-signed cert: {}", e))
        })?;

        let temp_dir = std::env::temp_dir();
        let unique_id = uuid::Uuid::new_v4();
        let cert_path = temp_dir.join(format!("porcupine-quic-test-{}.crt", unique_id));
        let key_path = temp_dir.join(format!("porcupine-quic-test-{}.key", unique_id));

        cert.save_to_files(&cert_path, &key_path).map_err(|e| {
            TransportError::TlsError(format!("Failed to save temp cert files: {}", e))
        })?;

        Self::server_default(cert_path, key_path)
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    /// Disable server certificate verification (INSECURE - only for testing!)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    /// Trust the certificates in a PEM file instead of the webpki roots
    ///
    /// Used to pin a relay's self-signed host identity.
    pub fn with_root_cert_file(mut self, path: impl AsRef<Path>) -> TransportResult<Self> {
        let certs = load_certs(path.as_ref())?;
        self.security.root_certs = certs.into_iter().map(|c| c.to_vec()).collect();
        Ok(self)
    }

    pub fn with_alpn_protocols(mut self, protocols: Vec<String>) -> Self {
        self.security.alpn_protocols = protocols;
        self
    }

    fn build_transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let idle_timeout = quinn::IdleTimeout::try_from(self.max_idle_timeout).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid idle timeout: {}", e))
        })?;
        let max_streams = quinn::VarInt::from_u64(self.max_concurrent_streams).map_err(|e| {
            TransportError::ConfigurationError(format!("Invalid stream limit: {}", e))
        })?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle_timeout));
        transport.max_concurrent_bidi_streams(max_streams);

        Ok(transport)
    }

    fn alpn(&self) -> Vec<Vec<u8>> {
        self.security
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect()
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let mut roots = quinn::rustls::RootCertStore::empty();

        if self.security.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &self.security.root_certs {
                roots
                    .add(quinn::rustls::pki_types::CertificateDer::from(
                        cert_der.clone(),
                    ))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        let mut client_crypto = if self.security.verify_server_cert {
            quinn::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            quinn::rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = self.alpn();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(self.build_transport_config()?));

        Ok(client_config)
    }

    /// Build quinn ServerConfig
    pub(crate) fn build_server_config(&self) -> TransportResult<quinn::ServerConfig> {
        let cert_path = self.server_cert_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server cert path required".to_string())
        })?;
        let key_path = self.server_key_path.as_ref().ok_or_else(|| {
            TransportError::ConfigurationError("Server key path required".to_string())
        })?;

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = self.alpn();

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(self.build_transport_config()?));

        Ok(server_config)
    }
}

impl TransportConfig for QuicConfig {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        if self.security.alpn_protocols.is_empty() {
            return Err(TransportError::ConfigurationError(
                "At least one ALPN protocol is required".to_string(),
            ));
        }

        Ok(())
    }
}

fn load_certs(
    path: &Path,
) -> TransportResult<Vec<quinn::rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

fn load_private_key(
    path: &Path,
) -> TransportResult<quinn::rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE - only for testing!)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = QuicConfig::client_default();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(3));
        assert_eq!(config.max_idle_timeout, Duration::from_secs(30));
        assert!(config.security_config().verify_server_cert);
        assert_eq!(config.security_config().alpn_protocols, vec!["porcupine-v1"]);
    }

    #[test]
    fn test_client_insecure_skips_verification() {
        let config = QuicConfig::client_insecure();
        assert!(!config.security_config().verify_server_cert);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_idle_timeout() {
        let config = QuicConfig::client_default().with_idle_timeout(Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_alpn_rejected() {
        let config = QuicConfig::client_default().with_alpn_protocols(Vec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_config_requires_paths() {
        let config = QuicConfig::client_default();
        assert!(matches!(
            config.build_server_config(),
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_missing_cert_file() {
        let config = QuicConfig::server_default("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .unwrap();
        assert!(matches!(
            config.build_server_config(),
            Err(TransportError::TlsError(_))
        ));
    }
}
