//! In-process transport
//!
//! Connections and streams backed by tokio channels. Closing either end of a
//! [`MemoryConnection`] pair closes both, and every stream opened on it fails
//! from then on, which is how a dropped QUIC connection looks to callers.

use crate::{
    ConnectionStats, TransportConnection, TransportError, TransportResult, TransportStream,
};
use async_trait::async_trait;
use porcupine_proto::TunnelMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Messages buffered per stream direction
const STREAM_CAPACITY: usize = 64;

/// One end of an in-process bidirectional stream
#[derive(Debug)]
pub struct MemoryStream {
    stream_id: u64,
    tx: Option<mpsc::Sender<TunnelMessage>>,
    rx: mpsc::Receiver<TunnelMessage>,
    connection_closed: CancellationToken,
}

/// Create a connected pair of streams that share no connection
pub fn memory_stream_pair(stream_id: u64, capacity: usize) -> (MemoryStream, MemoryStream) {
    stream_pair_with_token(stream_id, capacity, CancellationToken::new())
}

fn stream_pair_with_token(
    stream_id: u64,
    capacity: usize,
    connection_closed: CancellationToken,
) -> (MemoryStream, MemoryStream) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    (
        MemoryStream {
            stream_id,
            tx: Some(a_tx),
            rx: a_rx,
            connection_closed: connection_closed.clone(),
        },
        MemoryStream {
            stream_id,
            tx: Some(b_tx),
            rx: b_rx,
            connection_closed,
        },
    )
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;

        tokio::select! {
            _ = self.connection_closed.cancelled() => {
                Err(TransportError::ConnectionError("connection closed".to_string()))
            }
            result = tx.send(message.clone()) => {
                result.map_err(|_| TransportError::StreamClosed)
            }
        }
    }

    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>> {
        // Already-delivered messages stay readable after close
        tokio::select! {
            biased;
            message = self.rx.recv() => Ok(message),
            _ = self.connection_closed.cancelled() => {
                Err(TransportError::ConnectionError("connection closed".to_string()))
            }
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.tx = None;
        Ok(())
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn is_closed(&self) -> bool {
        self.tx.is_none() || self.connection_closed.is_cancelled()
    }
}

/// One end of an in-process multiplexed connection
#[derive(Debug)]
pub struct MemoryConnection {
    connection_id: String,
    side: u64,
    next_stream: AtomicU64,
    outgoing: mpsc::UnboundedSender<MemoryStream>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
    closed: CancellationToken,
    close_reason: Arc<Mutex<Option<(u32, String)>>>,
    remote_addr: SocketAddr,
    created_at: Instant,
}

/// Create a connected `(client, server)` pair
///
/// The client side reports `server_addr` as its remote address and the
/// server side reports `client_addr`.
pub fn memory_connection_pair(
    client_addr: SocketAddr,
    server_addr: SocketAddr,
) -> (MemoryConnection, MemoryConnection) {
    let closed = CancellationToken::new();
    let close_reason = Arc::new(Mutex::new(None));
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();
    let connection_id = Uuid::new_v4().to_string();

    let client = MemoryConnection {
        connection_id: connection_id.clone(),
        side: 0,
        next_stream: AtomicU64::new(0),
        outgoing: to_server,
        incoming: tokio::sync::Mutex::new(from_server),
        closed: closed.clone(),
        close_reason: close_reason.clone(),
        remote_addr: server_addr,
        created_at: Instant::now(),
    };

    let server = MemoryConnection {
        connection_id,
        side: 1,
        next_stream: AtomicU64::new(0),
        outgoing: to_client,
        incoming: tokio::sync::Mutex::new(from_client),
        closed,
        close_reason,
        remote_addr: client_addr,
        created_at: Instant::now(),
    };

    (client, server)
}

impl MemoryConnection {
    /// Error code and reason passed to the first `close` call, from either side
    pub fn close_reason(&self) -> Option<(u32, String)> {
        self.close_reason
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }

    /// Resolves once either side has closed the connection
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    type Stream = MemoryStream;

    async fn open_stream(&self) -> TransportResult<Self::Stream> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectionError(
                "connection closed".to_string(),
            ));
        }

        // Same numbering shape as QUIC: low bit marks the initiator
        let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed) * 4 + self.side;
        let (local, remote) = stream_pair_with_token(stream_id, STREAM_CAPACITY, self.closed.clone());

        self.outgoing
            .send(remote)
            .map_err(|_| TransportError::ConnectionError("peer went away".to_string()))?;

        Ok(local)
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        let mut incoming = self.incoming.lock().await;

        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            stream = incoming.recv() => Ok(stream),
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        if let Ok(mut guard) = self.close_reason.lock() {
            if guard.is_none() {
                *guard = Some((error_code, reason.to_string()));
            }
        }
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            uptime_secs: self.created_at.elapsed().as_secs(),
            ..Default::default()
        }
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
