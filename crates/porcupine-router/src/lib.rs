//! Hostname routing for public HTTP/HTTPS traffic
//!
//! The [`HostnameRegistry`] maps canonical hostnames to the tunnel session
//! that owns them. [`host`] extracts and normalises the routing key from a
//! raw request head.

pub mod host;
pub mod registry;

pub use host::{normalize_host, parse_request_head, HostError, RequestHead, MAX_HEAD_SIZE};
pub use registry::{HostnameRegistry, RegistryError, SessionHandle, TunnelRecord};
