//! Client authentication for tunnel sessions
//!
//! Clients are identified only by Ed25519 public keys. The relay keeps an
//! authorized-keys list ([`CredentialStore`]) and runs a challenge–response
//! ([`SessionAuthenticator`]) on every new session; the client proves key
//! possession with its [`ClientIdentity`].

pub mod authenticator;
pub mod credentials;
pub mod identity;

pub use authenticator::{fingerprint, AuthenticatedKey, SessionAuthenticator, AUTH_CONTEXT, NONCE_LEN};
pub use credentials::CredentialStore;
pub use identity::{ClientIdentity, HostIdentity, KEY_TYPE};

use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// Deliberately carries no detail; every rejection looks the same to the peer
    #[error("Authentication rejected")]
    Rejected,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
