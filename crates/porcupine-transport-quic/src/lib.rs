//! QUIC transport implementation using quinn
//!
//! A relay session is one QUIC connection. The client's first bidirectional
//! stream is the control stream; the relay opens one additional stream per
//! forwarded public connection. TLS 1.3 is mandatory and the ALPN protocol is
//! `porcupine-v1`.
//!
//! # Example
//!
//! ```no_run
//! use porcupine_transport_quic::{QuicConfig, QuicConnector, QuicListener};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Relay side
//! let config = Arc::new(QuicConfig::server_default("cert.pem", "key.pem")?);
//! let listener = QuicListener::new("0.0.0.0:2222".parse()?, config)?;
//!
//! // Client side
//! let connector = QuicConnector::new(Arc::new(QuicConfig::client_default()))?;
//! # Ok(())
//! # }
//! ```

// Initialize rustls crypto provider once globally
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::QuicStream;
