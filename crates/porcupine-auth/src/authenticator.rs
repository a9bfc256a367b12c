//! Challenge–response session authentication

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::credentials::{canonicalize_key, CredentialStore};
use crate::AuthError;

/// Domain separator prepended to every signed transcript
pub const AUTH_CONTEXT: &[u8] = b"porcupine-auth-v1";

/// Length of a challenge nonce in bytes
pub const NONCE_LEN: usize = 32;

/// A key that passed authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedKey {
    /// Canonical base64 of the raw public key
    pub public_key: String,
    /// Hex SHA-256 of the raw public key
    pub fingerprint: String,
}

/// Bytes a client signs to answer a challenge
pub fn signing_transcript(nonce: &[u8], public_key: &[u8]) -> Vec<u8> {
    let mut transcript = Vec::with_capacity(AUTH_CONTEXT.len() + nonce.len() + public_key.len());
    transcript.extend_from_slice(AUTH_CONTEXT);
    transcript.extend_from_slice(nonce);
    transcript.extend_from_slice(public_key);
    transcript
}

/// Hex SHA-256 fingerprint of a raw public key
pub fn fingerprint(public_key: &[u8]) -> String {
    Sha256::digest(public_key)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Verifies that a session holds an authorized private key
#[derive(Debug, Clone)]
pub struct SessionAuthenticator {
    credentials: Arc<CredentialStore>,
}

impl SessionAuthenticator {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Fresh random nonce for one authentication attempt
    pub fn challenge(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Check a challenge answer
    ///
    /// Every failure collapses to [`AuthError::Rejected`]; the reason is only
    /// logged locally.
    pub fn verify(
        &self,
        public_key: &str,
        nonce: &[u8],
        signature: &[u8],
    ) -> Result<AuthenticatedKey, AuthError> {
        let reject = |reason: &str| {
            debug!(reason, "Authentication rejected");
            AuthError::Rejected
        };

        if nonce.len() != NONCE_LEN {
            return Err(reject("nonce length"));
        }

        let canonical = canonicalize_key(public_key).map_err(|_| reject("malformed key"))?;
        if !self.credentials.contains(&canonical) {
            return Err(reject("key not authorized"));
        }

        let raw = STANDARD
            .decode(&canonical)
            .map_err(|_| reject("malformed key"))?;
        let key_bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| reject("key length"))?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| reject("invalid curve point"))?;

        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| reject("signature length"))?;
        let signature = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(&signing_transcript(nonce, &key_bytes), &signature)
            .map_err(|_| reject("bad signature"))?;

        Ok(AuthenticatedKey {
            public_key: canonical,
            fingerprint: fingerprint(&key_bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ClientIdentity;

    fn authenticator_for(identities: &[&ClientIdentity]) -> SessionAuthenticator {
        let store = CredentialStore::from_keys(identities.iter().map(|i| i.public_key_base64()));
        SessionAuthenticator::new(Arc::new(store))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let client = ClientIdentity::generate();
        let auth = authenticator_for(&[&client]);

        let nonce = auth.challenge();
        let signature = client.sign_challenge(&nonce);

        let key = auth
            .verify(&client.public_key_base64(), &nonce, &signature)
            .unwrap();
        assert_eq!(key.public_key, client.public_key_base64());
        assert_eq!(key.fingerprint, client.fingerprint());
        assert_eq!(key.fingerprint.len(), 64);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let known = ClientIdentity::generate();
        let stranger = ClientIdentity::generate();
        let auth = authenticator_for(&[&known]);

        let nonce = auth.challenge();
        let signature = stranger.sign_challenge(&nonce);

        assert!(matches!(
            auth.verify(&stranger.public_key_base64(), &nonce, &signature),
            Err(AuthError::Rejected)
        ));
    }

    #[test]
    fn test_wrong_nonce_rejected() {
        let client = ClientIdentity::generate();
        let auth = authenticator_for(&[&client]);

        let issued = auth.challenge();
        let other = auth.challenge();
        let signature = client.sign_challenge(&other);

        assert!(auth
            .verify(&client.public_key_base64(), &issued, &signature)
            .is_err());
    }

    #[test]
    fn test_signature_by_other_key_rejected() {
        let client = ClientIdentity::generate();
        let impostor = ClientIdentity::generate();
        let auth = authenticator_for(&[&client]);

        let nonce = auth.challenge();
        let signature = impostor.sign_challenge(&nonce);

        assert!(auth
            .verify(&client.public_key_base64(), &nonce, &signature)
            .is_err());
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        let client = ClientIdentity::generate();
        let auth = authenticator_for(&[&client]);
        let nonce = auth.challenge();
        let signature = client.sign_challenge(&nonce);

        assert!(auth.verify("!!!", &nonce, &signature).is_err());
        assert!(auth
            .verify(&client.public_key_base64(), &nonce[..16], &signature)
            .is_err());
        assert!(auth
            .verify(&client.public_key_base64(), &nonce, &signature[..10])
            .is_err());
    }

    #[test]
    fn test_empty_store_rejects_everyone() {
        let client = ClientIdentity::generate();
        let auth = SessionAuthenticator::new(Arc::new(CredentialStore::default()));

        let nonce = auth.challenge();
        let signature = client.sign_challenge(&nonce);

        assert!(auth
            .verify(&client.public_key_base64(), &nonce, &signature)
            .is_err());
    }

    #[test]
    fn test_challenges_are_unique() {
        let auth = SessionAuthenticator::new(Arc::new(CredentialStore::default()));
        assert_ne!(auth.challenge(), auth.challenge());
    }

    #[test]
    fn test_transcript_layout() {
        let transcript = signing_transcript(&[1, 2], &[3]);
        assert!(transcript.starts_with(AUTH_CONTEXT));
        assert_eq!(&transcript[AUTH_CONTEXT.len()..], &[1, 2, 3]);
    }
}
