//! QUIC listener and connector implementations

use async_trait::async_trait;
use porcupine_transport::{
    TransportConfig, TransportConnector, TransportError, TransportListener, TransportResult,
};
use quinn::Endpoint;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;
use crate::ensure_crypto_provider;

/// QUIC listener for accepting incoming connections
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
}

impl QuicListener {
    pub fn new(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        ensure_crypto_provider();
        TransportConfig::validate(&*config)?;

        let server_config = config.build_server_config()?;

        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportListener for QuicListener {
    type Connection = QuicConnection;

    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)> {
        loop {
            match self.endpoint.accept().await {
                Some(incoming) => {
                    let remote = incoming.remote_address();

                    debug!("Incoming QUIC connection from {}", remote);

                    match incoming.await {
                        Ok(connection) => {
                            debug!("QUIC connection established from {}", remote);
                            return Ok((QuicConnection::new(connection), remote));
                        }
                        Err(e) => {
                            warn!("Failed to establish QUIC connection from {}: {}", remote, e);
                            continue;
                        }
                    }
                }
                None => {
                    return Err(TransportError::ConnectionError(
                        "QUIC endpoint closed".to_string(),
                    ));
                }
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    async fn close(&self) {
        self.endpoint.close(0u32.into(), b"Listener closed");
        info!("QUIC listener closed");
    }
}

/// QUIC connector for establishing outgoing connections
#[derive(Debug)]
pub struct QuicConnector {
    config: Arc<QuicConfig>,
    client_config: quinn::ClientConfig,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        ensure_crypto_provider();
        TransportConfig::validate(&*config)?;

        let client_config = config.build_client_config()?;

        debug!("QUIC connector created");

        Ok(Self {
            config,
            client_config,
        })
    }

    pub fn config(&self) -> &QuicConfig {
        &self.config
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    type Connection = QuicConnection;

    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection> {
        debug!("Connecting to QUIC server: {} ({})", server_name, addr);

        // Fresh endpoint per attempt, bound to the relay's address family
        let bind_addr: SocketAddr = if addr.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind_addr).map_err(TransportError::IoError)?;
        endpoint.set_default_client_config(self.client_config.clone());

        let connecting = endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        info!("QUIC connection established to {} ({})", server_name, addr);

        Ok(QuicConnection::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connector_creation() {
        let connector = QuicConnector::new(Arc::new(QuicConfig::client_insecure()));
        assert!(connector.is_ok());
    }

    #[tokio::test]
    async fn test_listener_rejects_client_config() {
        let result = QuicListener::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(QuicConfig::client_default()),
        );
        assert!(matches!(result, Err(TransportError::ConfigurationError(_))));
    }
}
