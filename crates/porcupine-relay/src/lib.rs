//! Relay assembly
//!
//! Wires the QUIC control endpoint, the public HTTP/HTTPS listeners, the
//! hostname registry and the certificate manager into one [`Relay`].

pub mod config;
pub mod relay;

pub use config::RelayConfig;
pub use relay::Relay;

use porcupine_auth::AuthError;
use porcupine_cert::CertError;
use porcupine_server_http::ServerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Failed to start control endpoint on {address}: {reason}")]
    ControlBind { address: String, reason: String },

    #[error("Authentication setup failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Certificate setup failed: {0}")]
    Certificates(#[from] CertError),
}
