use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Ports below 1024 need elevated privileges\n  • Try using a different address or port")]
    Bind {
        address: String,
        port: u16,
        reason: String,
    },
}

impl ServerError {
    pub(crate) fn bind(addr: std::net::SocketAddr, err: std::io::Error) -> Self {
        ServerError::Bind {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: err.to_string(),
        }
    }
}
