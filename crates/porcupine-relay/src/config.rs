//! Relay configuration

use porcupine_control::ControlConfig;
use porcupine_proto::DEFAULT_CONTROL_PORT;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// QUIC control endpoint for tunnel clients
    pub control_addr: SocketAddr,
    /// Public plain-HTTP listener
    pub http_addr: SocketAddr,
    /// Public HTTPS listener; `None` disables TLS termination
    pub https_addr: Option<SocketAddr>,
    pub acme_email: Option<String>,
    /// Use the Let's Encrypt staging directory
    pub acme_staging: bool,
    /// Issued certificates and ACME account credentials
    pub cert_dir: PathBuf,
    pub authorized_keys: PathBuf,
    pub host_cert: Option<PathBuf>,
    pub host_key: Option<PathBuf>,
    /// Where a generated host identity is kept
    pub data_dir: PathBuf,
    /// Extra names for a generated host identity (besides `localhost`)
    pub host_names: Vec<String>,
    /// Issue self-signed certificates instead of using ACME
    pub self_signed: bool,
    pub renewal_interval: Duration,
    pub control: ControlConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_CONTROL_PORT)),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80)),
            https_addr: None,
            acme_email: None,
            acme_staging: false,
            cert_dir: PathBuf::from("./certs"),
            authorized_keys: PathBuf::from("./keys/authorized_keys"),
            host_cert: None,
            host_key: None,
            data_dir: PathBuf::from("./keys"),
            host_names: Vec::new(),
            self_signed: false,
            renewal_interval: Duration::from_secs(24 * 60 * 60),
            control: ControlConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Loopback listeners on ephemeral ports, state under `dir`
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let loopback = |port| SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        Self {
            control_addr: loopback(0),
            http_addr: loopback(0),
            cert_dir: dir.join("certs"),
            authorized_keys: dir.join("authorized_keys"),
            data_dir: dir,
            self_signed: true,
            ..Default::default()
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.https_addr.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.control_addr.port(), 2222);
        assert_eq!(config.http_addr.port(), 80);
        assert!(!config.tls_enabled());
        assert!(!config.acme_staging);
        assert_eq!(config.cert_dir, PathBuf::from("./certs"));
        assert_eq!(config.authorized_keys, PathBuf::from("./keys/authorized_keys"));
        assert_eq!(config.data_dir, PathBuf::from("./keys"));
    }

    #[test]
    fn test_local_layout() {
        let config = RelayConfig::local("/tmp/relay");
        assert!(config.control_addr.ip().is_loopback());
        assert_eq!(config.http_addr.port(), 0);
        assert_eq!(config.authorized_keys, PathBuf::from("/tmp/relay/authorized_keys"));
        assert!(config.self_signed);
    }
}
