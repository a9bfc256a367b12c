//! Relay control plane
//!
//! A [`ControlHandler`] drives one authenticated [`Session`] per client
//! connection: the challenge–response handshake, heartbeats, and the
//! Bind/Unbind requests that populate the shared [`Registry`]. The
//! [`Forwarder`] opens data-plane channels back through a session for each
//! public connection routed to it.

pub mod forwarder;
pub mod handler;
pub mod session;

pub use forwarder::{ForwardError, ForwardedChannel, Forwarder, RelayStats};
pub use handler::{ControlConfig, ControlError, ControlHandler};
pub use session::{ChannelOpener, Session};

/// Hostname registry keyed to relay sessions
pub type Registry = porcupine_router::HostnameRegistry<Session>;

/// A hostname binding owned by a relay session
pub type SessionRecord = porcupine_router::TunnelRecord<Session>;
