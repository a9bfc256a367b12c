//! QUIC connection implementation

use async_trait::async_trait;
use porcupine_transport::{ConnectionStats, TransportConnection, TransportError, TransportResult};
use quinn::Connection;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::stream::QuicStream;

/// QUIC connection wrapper
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    connection_id: String,
    created_at: Instant,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        let connection_id = format!("quic-{}", connection.stable_id());

        Self {
            inner: connection,
            connection_id,
            created_at: Instant::now(),
        }
    }

    /// Get the underlying quinn connection
    pub fn inner(&self) -> &Connection {
        &self.inner
    }

    /// Resolves when the connection is closed for any reason
    pub async fn closed(&self) -> quinn::ConnectionError {
        self.inner.closed().await
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!(stream_id = send.id().index(), "Opened bidirectional stream");

        Ok(QuicStream::new(send, recv))
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        match self.inner.accept_bi().await {
            Ok((send, recv)) => {
                trace!(stream_id = send.id().index(), "Accepted bidirectional stream");
                Ok(Some(QuicStream::new(send, recv)))
            }
            Err(quinn::ConnectionError::ApplicationClosed(close)) => {
                debug!(code = %close.error_code, "Connection closed by application");
                Ok(None)
            }
            Err(quinn::ConnectionError::ConnectionClosed(_)) => {
                debug!("Connection closed by peer");
                Ok(None)
            }
            Err(quinn::ConnectionError::LocallyClosed) => {
                debug!("Connection closed locally");
                Ok(None)
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!("Connection timed out");
                Ok(None)
            }
            Err(quinn::ConnectionError::Reset) => {
                debug!("Connection reset");
                Ok(None)
            }
            Err(e) => {
                warn!("Error accepting stream: {}", e);
                Ok(None)
            }
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());

        debug!(
            connection_id = %self.connection_id,
            code = error_code,
            reason,
            "QUIC connection closed"
        );
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn stats(&self) -> ConnectionStats {
        let quinn_stats = self.inner.stats();

        ConnectionStats {
            datagrams_sent: quinn_stats.udp_tx.datagrams,
            lost_packets: quinn_stats.path.lost_packets,
            rtt_ms: Some(quinn_stats.path.rtt.as_millis() as u32),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
