//! Data-plane forwarding: one tunnel stream per public connection

use porcupine_proto::TunnelMessage;
use porcupine_transport::{splice_counted, TransportError, TransportStream, SPLICE_CHUNK_SIZE};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Session;
use crate::{Registry, SessionRecord};

pub use porcupine_transport::SpliceStats as RelayStats;

/// Default deadline for the client to accept a channel
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Relay failed: {0}")]
    Relay(#[from] TransportError),
}

/// Opens data-plane channels through the session that owns a hostname
#[derive(Clone)]
pub struct Forwarder {
    registry: Arc<Registry>,
    open_timeout: Duration,
}

impl Forwarder {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }

    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Open a channel to the client behind `record`
    ///
    /// Any failure, including the client refusing because its local service
    /// is down, is reported as [`ForwardError::UpstreamUnavailable`].
    pub async fn open(&self, record: &SessionRecord) -> Result<ForwardedChannel, ForwardError> {
        let unavailable = |reason: String| {
            debug!(hostname = %record.hostname, session_id = %record.session_id, reason = %reason, "Channel open failed");
            ForwardError::UpstreamUnavailable(reason)
        };

        let session = record
            .live_session()
            .ok_or_else(|| unavailable("session closed".to_string()))?;
        let cancel = session.cancel_token();
        let channel_id = session.next_channel_id();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(unavailable("session closed".to_string())),
            outcome = tokio::time::timeout(self.open_timeout, open_handshake(&session, record, channel_id)) => outcome,
        };

        let stream = match outcome {
            Ok(Ok(Ok(stream))) => stream,
            Ok(Ok(Err(reason))) => {
                warn!(
                    hostname = %record.hostname,
                    channel_id,
                    reason = %reason,
                    "Client refused channel"
                );
                return Err(ForwardError::UpstreamUnavailable(format!("client refused: {}", reason)));
            }
            Ok(Err(e)) => return Err(unavailable(e.to_string())),
            Err(_) => return Err(unavailable(format!("no answer within {:?}", self.open_timeout))),
        };

        self.registry
            .track_channel(&record.hostname, &record.session_id, channel_id);
        debug!(hostname = %record.hostname, channel_id, "Channel opened");

        Ok(ForwardedChannel {
            stream,
            channel_id,
            hostname: record.hostname.clone(),
            session_id: record.session_id.clone(),
            cancel,
            registry: self.registry.clone(),
            stats: RelayStats::default(),
        })
    }
}

/// `Ok(Err(reason))` when the client refused the channel
async fn open_handshake(
    session: &Session,
    record: &SessionRecord,
    channel_id: u64,
) -> Result<Result<Box<dyn TransportStream>, String>, TransportError> {
    let mut stream = session.open_channel().await?;
    stream
        .send_message(&TunnelMessage::ChannelOpen {
            channel_id,
            hostname: record.hostname.clone(),
            local_port: record.local_port,
        })
        .await?;

    match stream.recv_message().await? {
        Some(TunnelMessage::ChannelAccepted { channel_id: accepted }) if accepted == channel_id => {
            Ok(Ok(stream))
        }
        Some(TunnelMessage::ChannelRefused { reason, .. }) => Ok(Err(reason)),
        Some(other) => Err(TransportError::ProtocolError(format!(
            "unexpected {} in reply to channel open",
            other.kind()
        ))),
        None => Err(TransportError::StreamClosed),
    }
}

/// An accepted data-plane channel for one public connection
pub struct ForwardedChannel {
    stream: Box<dyn TransportStream>,
    channel_id: u64,
    hostname: String,
    session_id: String,
    cancel: CancellationToken,
    registry: Arc<Registry>,
    stats: RelayStats,
}

impl ForwardedChannel {
    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Bytes relayed so far, also valid after a failed relay
    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Send `initial` (already-read request bytes), then relay until both
    /// directions are closed
    pub async fn relay<IO>(&mut self, counterpart: &mut IO, initial: &[u8]) -> Result<RelayStats, ForwardError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
    {
        for chunk in initial.chunks(SPLICE_CHUNK_SIZE) {
            let message = TunnelMessage::ChannelData {
                data: chunk.to_vec(),
            };
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ForwardError::UpstreamUnavailable("session closed".to_string()));
                }
                result = self.stream.send_message(&message) => result?,
            }
            self.stats.bytes_to_tunnel += chunk.len() as u64;
        }

        match splice_counted(&mut self.stream, counterpart, &self.cancel, &mut self.stats).await {
            Ok(()) => Ok(self.stats),
            Err(TransportError::Cancelled) => {
                Err(ForwardError::UpstreamUnavailable("session closed".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ForwardedChannel {
    fn drop(&mut self) {
        self.registry
            .untrack_channel(&self.hostname, &self.session_id, self.channel_id);
    }
}

impl std::fmt::Debug for ForwardedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardedChannel")
            .field("channel_id", &self.channel_id)
            .field("hostname", &self.hostname)
            .field("session_id", &self.session_id)
            .field("stats", &self.stats)
            .finish()
    }
}
