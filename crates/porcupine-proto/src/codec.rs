//! Codec for encoding/decoding tunnel messages

use crate::messages::TunnelMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Tunnel message codec
pub struct TunnelCodec;

impl TunnelCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Encode a tunnel message to bytes
    ///
    /// Format: [length: u32 BE][payload: bincode serialized message]
    pub fn encode(msg: &TunnelMessage) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a tunnel message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode(buf: &mut BytesMut) -> Result<Option<TunnelMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: TunnelMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }

    /// Try to decode multiple messages from buffer
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<TunnelMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = Self::decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let msg = TunnelMessage::Ping { timestamp: 12345 };

        let encoded = TunnelCodec::encode(&msg).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = TunnelCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let msg = TunnelMessage::Bind {
            hostname: "test.local".to_string(),
            local_port: 8080,
        };
        let encoded = TunnelCodec::encode(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        let result = TunnelCodec::decode(&mut buf).unwrap();
        assert_eq!(result, None);

        buf.extend_from_slice(&encoded[4..]);
        let result = TunnelCodec::decode(&mut buf).unwrap();
        assert_eq!(result, Some(msg));
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = TunnelMessage::ChannelOpen {
            channel_id: 7,
            hostname: "test.local".to_string(),
            local_port: 3000,
        };
        let msg2 = TunnelMessage::ChannelData {
            data: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        };
        let msg3 = TunnelMessage::ChannelClose;

        let mut buf = BytesMut::new();
        for msg in [&msg1, &msg2, &msg3] {
            buf.extend_from_slice(&TunnelCodec::encode(msg).unwrap());
        }

        let messages = TunnelCodec::decode_all(&mut buf).unwrap();
        assert_eq!(messages, vec![msg1, msg2, msg3]);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let result = TunnelCodec::decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge(_))));
    }

    #[test]
    fn test_decode_garbage_payload() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);

        let result = TunnelCodec::decode(&mut buf);
        assert!(matches!(result, Err(CodecError::SerializationError(_))));
    }
}
