//! Transport abstraction layer for tunnel sessions
//!
//! The relay and the client only talk to the traits in this crate. A session
//! is a [`TransportConnection`]: an authenticated, encrypted, multiplexed
//! connection that can open and accept independent [`TransportStream`]s. The
//! first stream a client opens is the control stream; every forwarded public
//! connection gets a fresh stream of its own.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 relay / client                           │
//! │     (control handler, forwarder, client connector)       │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            porcupine-transport (this crate)              │
//! │  - TransportListener    - TransportConnection            │
//! │  - TransportStream      - TransportConnector             │
//! │  - splice (byte relay)  - memory (in-process transport)  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌─────────────────────────┐
//! │ porcupine-transport-quic│
//! └─────────────────────────┘
//! ```

use async_trait::async_trait;
use porcupine_proto::TunnelMessage;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub mod memory;
pub mod splice;

pub use splice::{splice, splice_counted, SpliceStats, SPLICE_CHUNK_SIZE};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional stream over a transport connection
///
/// In QUIC this maps to a bidirectional stream. Messages are framed with
/// [`porcupine_proto::TunnelCodec`].
#[async_trait]
pub trait TransportStream: Send + Sync + Debug {
    /// Send a tunnel message on this stream
    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()>;

    /// Receive a tunnel message from this stream
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    /// Implementations must be cancel safe: dropping the future must not lose
    /// bytes that were already read.
    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Get the stream ID (unique within this connection)
    fn stream_id(&self) -> u64;

    /// Check if the stream is closed
    fn is_closed(&self) -> bool;
}

#[async_trait]
impl<S: TransportStream + ?Sized> TransportStream for Box<S> {
    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        (**self).send_message(message).await
    }

    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>> {
        (**self).recv_message().await
    }

    async fn finish(&mut self) -> TransportResult<()> {
        (**self).finish().await
    }

    fn stream_id(&self) -> u64 {
        (**self).stream_id()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// A transport connection that can create multiple streams
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// The stream type created by this connection
    type Stream: TransportStream + 'static;

    /// Open a new bidirectional stream
    async fn open_stream(&self) -> TransportResult<Self::Stream>;

    /// Accept an incoming bidirectional stream
    ///
    /// Returns `None` when the connection is closed and no more streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection
    ///
    /// # Arguments
    /// * `error_code` - Application-specific error code (0 for normal closure)
    /// * `reason` - Human-readable reason for closure
    async fn close(&self, error_code: u32, reason: &str);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get the remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;

    /// Stable identifier for logging and correlation
    fn connection_id(&self) -> String;
}

/// Application close codes used on tunnel connections
pub mod close_code {
    /// Normal shutdown
    pub const NORMAL: u32 = 0;
    /// Authentication failed
    pub const AUTH_REJECTED: u32 = 1;
    /// Peer violated the protocol
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Heartbeat timed out
    pub const HEARTBEAT_TIMEOUT: u32 = 3;
}

/// Statistics about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// UDP datagrams sent
    pub datagrams_sent: u64,

    /// Packets lost on the current path
    pub lost_packets: u64,

    /// Round-trip time estimate (milliseconds)
    pub rtt_ms: Option<u32>,

    /// Connection uptime (seconds)
    pub uptime_secs: u64,
}

/// Server-side: Listens for incoming transport connections
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// The connection type accepted by this listener
    type Connection: TransportConnection;

    /// Accept an incoming connection
    async fn accept(&self) -> TransportResult<(Self::Connection, SocketAddr)>;

    /// Get the local address this listener is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting new connections
    async fn close(&self);
}

/// Client-side: Establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// The connection type created by this connector
    type Connection: TransportConnection;

    /// Connect to a remote server
    ///
    /// # Arguments
    /// * `addr` - The socket address to connect to
    /// * `server_name` - The server name for TLS verification (e.g., "relay.example.com")
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Self::Connection>;
}

/// Configuration for transport security
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Custom root CA certificates, DER encoded (system roots when empty)
    pub root_certs: Vec<Vec<u8>>,

    /// Application-Layer Protocol Negotiation (ALPN) protocols
    pub alpn_protocols: Vec<String>,
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: vec![porcupine_proto::ALPN_PROTOCOL.to_string()],
        }
    }
}

/// Transport-specific configuration
pub trait TransportConfig: Send + Sync + Debug {
    /// Get the security configuration
    fn security_config(&self) -> &TransportSecurityConfig;

    /// Validate the configuration
    fn validate(&self) -> TransportResult<()>;
}
