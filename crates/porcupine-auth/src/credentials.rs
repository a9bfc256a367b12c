//! Authorized public keys
//!
//! One key per line, either `<type> <base64> [comment]` (OpenSSH
//! `authorized_keys` layout) or a bare `<base64>`. The blob may be a raw
//! 32-byte Ed25519 key or an SSH wire-format `ssh-ed25519` key; both are
//! stored as the base64 of the raw key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::AuthError;

const SSH_ED25519: &str = "ssh-ed25519";

/// Set of canonical (base64 raw) Ed25519 public keys
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    keys: HashSet<String>,
}

impl CredentialStore {
    /// Load the authorized-keys file
    ///
    /// A missing file yields an empty store; malformed lines are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %path.display(),
                    "Authorized keys file not found; no client can authenticate"
                );
                return Ok(Self::default());
            }
            Err(e) => return Err(AuthError::Io(e)),
        };

        let store = Self::parse(&contents);
        info!(path = %path.display(), keys = store.len(), "Loaded authorized keys");
        Ok(store)
    }

    /// Parse authorized-keys text
    pub fn parse(contents: &str) -> Self {
        let mut keys = HashSet::new();

        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_authorized_key_line(line) {
                Ok(key) => {
                    debug!(line = index + 1, "Authorized key loaded");
                    keys.insert(key);
                }
                Err(e) => warn!(line = index + 1, "Skipping authorized key: {}", e),
            }
        }

        Self { keys }
    }

    /// Build a store from already-canonical keys
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a canonical key is authorized
    pub fn contains(&self, canonical: &str) -> bool {
        self.keys.contains(canonical)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Canonical key of one authorized-keys line
pub fn parse_authorized_key_line(line: &str) -> Result<String, AuthError> {
    let mut fields = line.split_whitespace();
    let first = fields
        .next()
        .ok_or_else(|| AuthError::InvalidKey("empty line".to_string()))?;

    // `<type> <blob> [comment]` or a bare blob
    let blob = match fields.next() {
        Some(second) => second,
        None => first,
    };

    canonicalize_key(blob)
}

/// Canonical form of a base64 key blob: base64 of the raw 32 bytes
pub fn canonicalize_key(blob: &str) -> Result<String, AuthError> {
    let bytes = STANDARD
        .decode(blob)
        .map_err(|e| AuthError::InvalidKey(format!("bad base64: {}", e)))?;

    let raw = match bytes.len() {
        32 => bytes,
        _ => extract_ssh_ed25519(&bytes)?,
    };

    Ok(STANDARD.encode(raw))
}

/// Raw key from an SSH wire-format `ssh-ed25519` blob
fn extract_ssh_ed25519(blob: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut rest = blob;

    let key_type = read_ssh_string(&mut rest)?;
    if key_type != SSH_ED25519.as_bytes() {
        return Err(AuthError::InvalidKey(format!(
            "unsupported key type {:?}",
            String::from_utf8_lossy(key_type)
        )));
    }

    let key = read_ssh_string(&mut rest)?;
    if key.len() != 32 || !rest.is_empty() {
        return Err(AuthError::InvalidKey("malformed ssh-ed25519 blob".to_string()));
    }

    Ok(key.to_vec())
}

fn read_ssh_string<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], AuthError> {
    let truncated = || AuthError::InvalidKey("truncated key blob".to_string());

    if input.len() < 4 {
        return Err(truncated());
    }
    let (len_bytes, rest) = input.split_at(4);
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;

    if rest.len() < len {
        return Err(truncated());
    }
    let (value, rest) = rest.split_at(len);
    *input = rest;
    Ok(value)
}
