//! Protocol message types

use serde::{Deserialize, Serialize};

/// Main tunnel protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TunnelMessage {
    // Session handshake (control stream)
    /// Client announces its public key (base64 of the raw Ed25519 key)
    Hello {
        protocol_version: u32,
        public_key: String,
    },
    /// Relay asks the client to prove possession of the announced key
    Challenge {
        #[serde(with = "serde_bytes")]
        nonce: Vec<u8>,
    },
    /// Signature over the challenge transcript
    Authenticate {
        #[serde(with = "serde_bytes")]
        signature: Vec<u8>,
    },
    Authenticated {
        session_id: String,
    },
    /// Deliberately carries no reason
    AuthRejected,

    // Control messages
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Bind {
        hostname: String,
        local_port: u16,
    },
    BindAccepted {
        hostname: String,
        token: String,
    },
    BindRejected {
        hostname: String,
        reason: BindRejection,
    },
    Unbind {
        hostname: String,
    },
    Unbound {
        hostname: String,
    },
    Disconnect {
        reason: String,
    },
    DisconnectAck,

    // Data channel messages (one stream per forwarded connection)
    ChannelOpen {
        channel_id: u64,
        hostname: String,
        local_port: u16,
    },
    ChannelAccepted {
        channel_id: u64,
    },
    ChannelRefused {
        channel_id: u64,
        reason: String,
    },
    ChannelData {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// No more data will be sent in this direction
    ChannelClose,
}

impl TunnelMessage {
    /// Short name used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            TunnelMessage::Hello { .. } => "hello",
            TunnelMessage::Challenge { .. } => "challenge",
            TunnelMessage::Authenticate { .. } => "authenticate",
            TunnelMessage::Authenticated { .. } => "authenticated",
            TunnelMessage::AuthRejected => "auth_rejected",
            TunnelMessage::Ping { .. } => "ping",
            TunnelMessage::Pong { .. } => "pong",
            TunnelMessage::Bind { .. } => "bind",
            TunnelMessage::BindAccepted { .. } => "bind_accepted",
            TunnelMessage::BindRejected { .. } => "bind_rejected",
            TunnelMessage::Unbind { .. } => "unbind",
            TunnelMessage::Unbound { .. } => "unbound",
            TunnelMessage::Disconnect { .. } => "disconnect",
            TunnelMessage::DisconnectAck => "disconnect_ack",
            TunnelMessage::ChannelOpen { .. } => "channel_open",
            TunnelMessage::ChannelAccepted { .. } => "channel_accepted",
            TunnelMessage::ChannelRefused { .. } => "channel_refused",
            TunnelMessage::ChannelData { .. } => "channel_data",
            TunnelMessage::ChannelClose => "channel_close",
        }
    }
}

/// Why a bind request was refused
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BindRejection {
    /// Hostname does not match the label grammar
    InvalidHostname,
    /// Hostname is held by another live session
    HostnameConflict,
}

impl std::fmt::Display for BindRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindRejection::InvalidHostname => write!(f, "invalid hostname"),
            BindRejection::HostnameConflict => write!(f, "hostname is in use by another tunnel"),
        }
    }
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_rejected_serialization() {
        let msg = TunnelMessage::BindRejected {
            hostname: "app.example.com".to_string(),
            reason: BindRejection::HostnameConflict,
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_challenge_nonce_preserved() {
        let nonce: Vec<u8> = (0u8..32).collect();
        let msg = TunnelMessage::Challenge {
            nonce: nonce.clone(),
        };

        let serialized = bincode::serialize(&msg).unwrap();
        let deserialized: TunnelMessage = bincode::deserialize(&serialized).unwrap();

        if let TunnelMessage::Challenge { nonce: decoded } = deserialized {
            assert_eq!(decoded, nonce);
        } else {
            panic!("Expected Challenge message");
        }
    }

    #[test]
    fn test_auth_rejected_has_no_payload() {
        let serialized = bincode::serialize(&TunnelMessage::AuthRejected).unwrap();
        // Variant tag only
        assert_eq!(serialized.len(), 4);
    }

    #[test]
    fn test_message_kind() {
        assert_eq!(TunnelMessage::ChannelClose.kind(), "channel_close");
        assert_eq!(
            TunnelMessage::Bind {
                hostname: "a".to_string(),
                local_port: 80
            }
            .kind(),
            "bind"
        );
    }

    #[test]
    fn test_bind_rejection_display() {
        assert_eq!(BindRejection::InvalidHostname.to_string(), "invalid hostname");
        assert!(BindRejection::HostnameConflict
            .to_string()
            .contains("another tunnel"));
    }
}
