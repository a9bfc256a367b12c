//! QUIC stream implementation

use async_trait::async_trait;
use bytes::BytesMut;
use porcupine_proto::{TunnelCodec, TunnelMessage};
use porcupine_transport::{TransportError, TransportResult, TransportStream};
use quinn::{RecvStream, SendStream};
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

/// QUIC bidirectional stream carrying framed tunnel messages
///
/// The two directions close independently: `finish` ends the send side
/// while `recv_message` keeps draining until the peer finishes.
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
    send_closed: bool,
    recv_closed: bool,
    recv_buffer: BytesMut,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
            send_closed: false,
            recv_closed: false,
            recv_buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }
}

#[async_trait]
impl TransportStream for QuicStream {
    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        if self.send_closed {
            return Err(TransportError::StreamClosed);
        }

        let encoded = TunnelCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.send
            .write_all(&encoded)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!(stream_id = self.stream_id, kind = message.kind(), "Sent message");

        Ok(())
    }

    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>> {
        loop {
            if let Some(msg) = TunnelCodec::decode(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                trace!(stream_id = self.stream_id, kind = msg.kind(), "Received message");
                return Ok(Some(msg));
            }

            if self.recv_closed {
                return Ok(None);
            }

            // read_chunk is cancel safe; the chunk is buffered before the next await
            match self.recv.read_chunk(READ_CHUNK, true).await {
                Ok(Some(chunk)) => {
                    self.recv_buffer.extend_from_slice(&chunk.bytes);
                }
                Ok(None) => {
                    self.recv_closed = true;
                    if !self.recv_buffer.is_empty() {
                        return Err(TransportError::ProtocolError(
                            "Incomplete message in buffer".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                Err(quinn::ReadError::ConnectionLost(e)) => {
                    self.recv_closed = true;
                    return Err(TransportError::ConnectionError(format!(
                        "Connection lost: {}",
                        e
                    )));
                }
                Err(e) => {
                    self.recv_closed = true;
                    return Err(TransportError::ConnectionError(e.to_string()));
                }
            }
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.send_closed {
            return Ok(());
        }

        self.send_closed = true;
        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn is_closed(&self) -> bool {
        self.send_closed && self.recv_closed
    }
}
