//! Tunnel client
//!
//! Connects to a relay, authenticates with the client's Ed25519 key, binds a
//! public hostname and pairs every channel the relay opens with a fresh
//! connection to the local service.

pub mod config;
pub mod connector;
pub mod reconnect;

pub use config::{parse_relay_address, ClientConfig, ClientConfigBuilder};
pub use connector::{quic_connector, ClientState, TunnelClient, DISCONNECT_TIMEOUT, HANDSHAKE_TIMEOUT};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};

use porcupine_auth::AuthError;
use porcupine_proto::BindRejection;
use porcupine_transport::TransportError;
use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity error: {0}")]
    Identity(#[from] AuthError),

    #[error("Authentication rejected by relay")]
    AuthRejected,

    #[error("Relay rejected {hostname}: {reason}")]
    BindRejected {
        hostname: String,
        reason: BindRejection,
    },

    #[error("Giving up after {0} retries")]
    RetriesExhausted(usize),

    #[error("Could not resolve relay {0}")]
    Resolve(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Retrying cannot help
    ///
    /// A hostname conflict on a reconnect is the exception: the relay may
    /// still be holding this client's previous session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::Config(_)
                | ClientError::Identity(_)
                | ClientError::AuthRejected
                | ClientError::BindRejected { .. }
                | ClientError::RetriesExhausted(_)
        )
    }

    pub fn is_hostname_conflict(&self) -> bool {
        matches!(
            self,
            ClientError::BindRejected {
                reason: BindRejection::HostnameConflict,
                ..
            }
        )
    }
}
