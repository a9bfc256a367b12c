//! Porcupine Protocol Definitions
//!
//! Wire messages exchanged between the relay and tunnel clients, the
//! length-prefixed codec that frames them, and the hostname grammar shared by
//! the control plane and the public routers.

pub mod codec;
pub mod hostname;
pub mod messages;

pub use codec::{CodecError, TunnelCodec};
pub use hostname::{canonicalize_hostname, random_subdomain, HostnameError};
pub use messages::*;

/// Protocol version carried in the `Hello` handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// ALPN identifier negotiated on the QUIC control connection
pub const ALPN_PROTOCOL: &str = "porcupine-v1";

/// Default relay control port
pub const DEFAULT_CONTROL_PORT: u16 = 2222;
