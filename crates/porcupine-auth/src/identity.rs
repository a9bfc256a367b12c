//! Key material owned by each side of a tunnel
//!
//! [`ClientIdentity`] is the Ed25519 key a client authenticates with.
//! [`HostIdentity`] is the TLS certificate/key pair the relay presents on its
//! QUIC control endpoint.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::authenticator::{fingerprint, signing_transcript};
use crate::AuthError;

/// Key type label written into authorized-keys lines
pub const KEY_TYPE: &str = "porcupine-ed25519";

const HOST_CERT_FILE: &str = "host-cert.pem";
const HOST_KEY_FILE: &str = "host-key.pem";
const HOST_CERT_VALIDITY_DAYS: i64 = 3650;

/// A client's Ed25519 signing key
pub struct ClientIdentity {
    signing_key: SigningKey,
}

impl ClientIdentity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Load a private key file (base64 of the 32-byte seed)
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AuthError::Identity(format!("cannot read {}: {}", path.display(), e))
        })?;

        let bytes = STANDARD
            .decode(contents.trim())
            .map_err(|e| AuthError::InvalidKey(format!("{}: {}", path.display(), e)))?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            AuthError::InvalidKey(format!("{}: expected 32-byte seed", path.display()))
        })?;

        Ok(Self::from_secret_bytes(&secret))
    }

    /// Write the private key and `<path>.pub` with the authorized-keys line
    pub fn save(&self, path: impl AsRef<Path>, comment: &str) -> Result<PathBuf, AuthError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, format!("{}\n", STANDARD.encode(self.signing_key.to_bytes())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        let mut public_path = path.as_os_str().to_owned();
        public_path.push(".pub");
        let public_path = PathBuf::from(public_path);
        std::fs::write(&public_path, format!("{}\n", self.authorized_keys_line(comment)))?;

        Ok(public_path)
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public_key_bytes())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }

    /// Line to append to the relay's authorized-keys file
    pub fn authorized_keys_line(&self, comment: &str) -> String {
        let line = format!("{} {}", KEY_TYPE, self.public_key_base64());
        if comment.is_empty() {
            line
        } else {
            format!("{} {}", line, comment)
        }
    }

    /// Sign a relay challenge
    pub fn sign_challenge(&self, nonce: &[u8]) -> Vec<u8> {
        let transcript = signing_transcript(nonce, &self.public_key_bytes());
        self.signing_key.sign(&transcript).to_bytes().to_vec()
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// TLS certificate and key the relay serves on its control endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl HostIdentity {
    /// Resolve the relay's host identity
    ///
    /// Explicit paths win and must both be given. Otherwise a self-signed
    /// pair under `data_dir` is reused, or generated on first start for
    /// `localhost` plus `names`.
    pub fn resolve(
        cert_path: Option<PathBuf>,
        key_path: Option<PathBuf>,
        data_dir: &Path,
        names: &[String],
    ) -> Result<Self, AuthError> {
        match (cert_path, key_path) {
            (Some(cert_path), Some(key_path)) => Ok(Self {
                cert_path,
                key_path,
            }),
            (None, None) => Self::load_or_generate(data_dir, names),
            _ => Err(AuthError::Identity(
                "host certificate and key must be given together".to_string(),
            )),
        }
    }

    fn load_or_generate(data_dir: &Path, names: &[String]) -> Result<Self, AuthError> {
        let identity = Self {
            cert_path: data_dir.join(HOST_CERT_FILE),
            key_path: data_dir.join(HOST_KEY_FILE),
        };

        if identity.cert_path.exists() && identity.key_path.exists() {
            return Ok(identity);
        }

        let mut domains = vec!["localhost".to_string()];
        domains.extend(names.iter().filter(|n| n.as_str() != "localhost").cloned());

        let cert = porcupine_cert::generate_self_signed_cert_with_domains(
            &domains,
            HOST_CERT_VALIDITY_DAYS,
        )
        .map_err(|e| AuthError::Identity(e.to_string()))?;
        cert.save_to_files(&identity.cert_path, &identity.key_path)?;

        info!(
            cert = %identity.cert_path.display(),
            names = ?domains,
            "Generated self-signed host identity"
        );
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::parse_authorized_key_line;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/id_porcupine");

        let identity = ClientIdentity::generate();
        let public_path = identity.save(&path, "dev@laptop").unwrap();

        let loaded = ClientIdentity::load(&path).unwrap();
        assert_eq!(loaded.public_key_bytes(), identity.public_key_bytes());

        let public_line = std::fs::read_to_string(&public_path).unwrap();
        assert!(public_line.starts_with(KEY_TYPE));
        assert!(public_line.trim_end().ends_with("dev@laptop"));
        assert_eq!(
            parse_authorized_key_line(public_line.trim()).unwrap(),
            identity.public_key_base64()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_porcupine");
        ClientIdentity::generate().save(&path, "").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_porcupine");
        std::fs::write(&path, "c2hvcnQ=\n").unwrap();

        assert!(matches!(
            ClientIdentity::load(&path),
            Err(AuthError::InvalidKey(_))
        ));
        assert!(ClientIdentity::load(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let identity = ClientIdentity::from_secret_bytes(&[7u8; 32]);
        let debug = format!("{:?}", identity);
        assert!(debug.contains("fingerprint"));
        assert!(!debug.contains(&STANDARD.encode([7u8; 32])));
    }

    #[test]
    fn test_host_identity_generated_once() {
        let dir = tempfile::tempdir().unwrap();

        let first =
            HostIdentity::resolve(None, None, dir.path(), &["relay.example.com".to_string()])
                .unwrap();
        assert!(first.cert_path.exists());
        assert!(first.key_path.exists());
        let pem = std::fs::read_to_string(&first.cert_path).unwrap();

        let second = HostIdentity::resolve(None, None, dir.path(), &[]).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&second.cert_path).unwrap(), pem);
    }

    #[test]
    fn test_host_identity_explicit_paths() {
        let dir = tempfile::tempdir().unwrap();
        let identity = HostIdentity::resolve(
            Some(PathBuf::from("/etc/porcupine/cert.pem")),
            Some(PathBuf::from("/etc/porcupine/key.pem")),
            dir.path(),
            &[],
        )
        .unwrap();
        assert_eq!(identity.cert_path, PathBuf::from("/etc/porcupine/cert.pem"));

        assert!(HostIdentity::resolve(
            Some(PathBuf::from("/etc/porcupine/cert.pem")),
            None,
            dir.path(),
            &[]
        )
        .is_err());
    }
}
