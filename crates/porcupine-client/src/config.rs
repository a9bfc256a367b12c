//! Client configuration

use porcupine_proto::{canonicalize_hostname, DEFAULT_CONTROL_PORT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;
use crate::ClientError;

/// Tunnel client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `host[:port]` of the relay control endpoint
    pub relay_addr: String,
    /// Public hostname to bind (canonical form)
    pub hostname: String,
    pub local_host: String,
    pub local_port: u16,
    pub max_retries: usize,
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Skip relay certificate verification (development only)
    pub insecure: bool,
    /// PEM certificate to trust for the relay instead of the webpki roots
    pub relay_cert: Option<PathBuf>,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_addr: format!("localhost:{}", DEFAULT_CONTROL_PORT),
            hostname: String::new(),
            local_host: "localhost".to_string(),
            local_port: 0,
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
            insecure: false,
            relay_cert: None,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::fixed(self.retry_delay, self.max_retries)
    }

    /// Relay host (also the TLS server name) and port
    pub fn relay_endpoint(&self) -> Result<(String, u16), ClientError> {
        parse_relay_address(&self.relay_addr)
    }

    /// Resolve the relay address; returns the socket address and TLS server name
    pub async fn resolve_relay(&self) -> Result<(SocketAddr, String), ClientError> {
        let (host, port) = self.relay_endpoint()?;
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| ClientError::Resolve(format!("{}: {}", host, e)))?
            .next()
            .ok_or_else(|| ClientError::Resolve(format!("{}: no addresses", host)))?;
        Ok((addr, host))
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Split `host[:port]`, defaulting to the standard control port
///
/// IPv6 literals need brackets when a port is given: `[::1]:2222`.
pub fn parse_relay_address(addr: &str) -> Result<(String, u16), ClientError> {
    let addr = addr.trim();
    let invalid = || ClientError::Config(format!("Invalid relay address: {:?}", addr));

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
        match rest.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if rest.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else if addr.matches(':').count() == 1 {
        let (host, port) = addr.split_once(':').ok_or_else(invalid)?;
        (host, Some(port))
    } else {
        (addr, None)
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_CONTROL_PORT,
    };
    Ok((host.to_string(), port))
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn relay_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.relay_addr = addr.into();
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = insecure;
        self
    }

    pub fn relay_cert(mut self, path: Option<PathBuf>) -> Self {
        self.config.relay_cert = path;
        self
    }

    pub fn build(mut self) -> Result<ClientConfig, ClientError> {
        self.config.hostname = canonicalize_hostname(&self.config.hostname)
            .map_err(|e| ClientError::Config(format!("{}: {:?}", e, self.config.hostname)))?;
        if self.config.local_port == 0 {
            return Err(ClientError::Config("local port is required".to_string()));
        }
        parse_relay_address(&self.config.relay_addr)?;
        Ok(self.config)
    }
}
