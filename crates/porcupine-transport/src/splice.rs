//! Transparent byte relay between a tunnel stream and a local socket
//!
//! Bytes read from the socket travel as `ChannelData` frames; the socket's
//! EOF travels as `ChannelClose`. In the other direction every frame is
//! written (and flushed) before the next one is read, so a slow reader on
//! either end stalls the opposite side instead of growing a buffer.

use crate::{TransportError, TransportResult, TransportStream};
use porcupine_proto::TunnelMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Largest chunk read from the socket per `ChannelData` frame
pub const SPLICE_CHUNK_SIZE: usize = 16 * 1024;

/// Byte counters for one spliced pairing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceStats {
    /// Bytes read from the socket and sent into the tunnel
    pub bytes_to_tunnel: u64,
    /// Bytes received from the tunnel and written to the socket
    pub bytes_from_tunnel: u64,
}

/// Relay bytes between `stream` and `io` until both directions are closed
///
/// Half-close is propagated in both directions: socket EOF sends
/// `ChannelClose`, and a received `ChannelClose` shuts down the socket's
/// write half. Returns `TransportError::Cancelled` if `cancel` fires first.
pub async fn splice<S, IO>(
    stream: &mut S,
    io: &mut IO,
    cancel: &CancellationToken,
) -> TransportResult<SpliceStats>
where
    S: TransportStream + ?Sized,
    IO: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
{
    let mut stats = SpliceStats::default();
    splice_counted(stream, io, cancel, &mut stats).await?;
    Ok(stats)
}

/// [`splice`] that keeps its counters in `stats`, so they survive an error
pub async fn splice_counted<S, IO>(
    stream: &mut S,
    io: &mut IO,
    cancel: &CancellationToken,
    stats: &mut SpliceStats,
) -> TransportResult<()>
where
    S: TransportStream + ?Sized,
    IO: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
{
    let stream_id = stream.stream_id();
    let mut buffer = vec![0u8; SPLICE_CHUNK_SIZE];
    let mut reading_socket = true;
    let mut reading_tunnel = true;

    while reading_socket || reading_tunnel {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(stream_id, "Splice cancelled");
                return Err(TransportError::Cancelled);
            }

            // Socket → Tunnel
            result = io.read(&mut buffer), if reading_socket => {
                match result? {
                    0 => {
                        trace!(stream_id, "Socket reached EOF");
                        reading_socket = false;
                        stream.send_message(&TunnelMessage::ChannelClose).await?;
                    }
                    n => {
                        stream
                            .send_message(&TunnelMessage::ChannelData {
                                data: buffer[..n].to_vec(),
                            })
                            .await?;
                        stats.bytes_to_tunnel += n as u64;
                    }
                }
            }

            // Tunnel → Socket
            result = stream.recv_message(), if reading_tunnel => {
                match result? {
                    Some(TunnelMessage::ChannelData { data }) => {
                        io.write_all(&data).await?;
                        io.flush().await?;
                        stats.bytes_from_tunnel += data.len() as u64;
                    }
                    Some(TunnelMessage::ChannelClose) | None => {
                        trace!(stream_id, "Tunnel side closed");
                        reading_tunnel = false;
                        // Peer may already be gone; the socket is closing anyway
                        let _ = io.shutdown().await;
                    }
                    Some(other) => {
                        return Err(TransportError::ProtocolError(format!(
                            "unexpected {} frame on data channel",
                            other.kind()
                        )));
                    }
                }
            }
        }
    }

    let _ = stream.finish().await;

    debug!(
        stream_id,
        bytes_to_tunnel = stats.bytes_to_tunnel,
        bytes_from_tunnel = stats.bytes_from_tunnel,
        "Splice finished"
    );

    Ok(())
}
