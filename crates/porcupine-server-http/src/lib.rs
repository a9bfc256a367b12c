//! Public HTTP and HTTPS listeners
//!
//! Both listeners route by hostname only: the `Host` header (plain HTTP) or
//! the TLS SNI plus `Host` header (HTTPS) selects a tunnel from the
//! registry, and the raw request bytes are relayed unmodified.

pub mod error;
pub mod http;
pub mod https;
pub mod proxy;
pub mod response;

pub use error::ServerError;
pub use http::HttpServer;
pub use https::HttpsServer;
pub use proxy::RouteContext;
