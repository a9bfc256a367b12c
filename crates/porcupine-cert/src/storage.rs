//! On-disk certificate storage
//!
//! Layout: `<cert_dir>/<domain>/fullchain.pem` and `<cert_dir>/<domain>/key.pem`.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::authority::{parse_expiry, IssuedCertificate};
use crate::CertError;

const CHAIN_FILE: &str = "fullchain.pem";
const KEY_FILE: &str = "key.pem";

#[derive(Debug, Clone)]
pub struct CertificateStore {
    root: PathBuf,
}

impl CertificateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn domain_dir(&self, domain: &str) -> Result<PathBuf, CertError> {
        // Must stay a single path segment under root
        if domain.is_empty() || domain.contains(['/', '\\']) || domain.starts_with('.') {
            return Err(CertError::Storage(format!("invalid domain: {}", domain)));
        }
        Ok(self.root.join(domain))
    }

    pub async fn save(&self, domain: &str, cert: &IssuedCertificate) -> Result<(), CertError> {
        let dir = self.domain_dir(domain)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CertError::Storage(format!("{}: {}", dir.display(), e)))?;

        tokio::fs::write(dir.join(CHAIN_FILE), &cert.certificate_chain_pem)
            .await
            .map_err(|e| CertError::Storage(e.to_string()))?;
        tokio::fs::write(dir.join(KEY_FILE), &cert.private_key_pem)
            .await
            .map_err(|e| CertError::Storage(e.to_string()))?;

        debug!(domain, path = %dir.display(), "Certificate saved");
        Ok(())
    }

    pub async fn load(&self, domain: &str) -> Result<Option<IssuedCertificate>, CertError> {
        let dir = self.domain_dir(domain)?;
        let chain_path = dir.join(CHAIN_FILE);
        let key_path = dir.join(KEY_FILE);

        if !chain_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let certificate_chain_pem = tokio::fs::read_to_string(&chain_path)
            .await
            .map_err(|e| CertError::Storage(e.to_string()))?;
        let private_key_pem = tokio::fs::read_to_string(&key_path)
            .await
            .map_err(|e| CertError::Storage(e.to_string()))?;
        let expires_at = parse_expiry(&certificate_chain_pem)?;

        Ok(Some(IssuedCertificate {
            private_key_pem,
            certificate_chain_pem,
            expires_at,
        }))
    }

    /// Every stored certificate; unreadable entries are skipped with a warning
    pub async fn load_all(&self) -> Result<Vec<(String, IssuedCertificate)>, CertError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CertError::Storage(e.to_string())),
        };

        let mut loaded = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CertError::Storage(e.to_string()))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let Some(domain) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_dir {
                continue;
            }

            match self.load(&domain).await {
                Ok(Some(cert)) => loaded.push((domain, cert)),
                Ok(None) => {}
                Err(e) => warn!(domain, "Skipping stored certificate: {}", e),
            }
        }

        Ok(loaded)
    }
}
