//! TLS-terminating listener with per-hostname certificates
//!
//! The ClientHello is read first (`LazyConfigAcceptor`), so the certificate
//! for the SNI hostname can be fetched or issued before the handshake
//! continues. Lookups for one hostname never hold up handshakes for another.

use dashmap::DashMap;
use porcupine_cert::CertificateManager;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::proxy::{serve_tls_connection, RouteContext};
use crate::ServerError;

/// How often TLS configs of hostnames that are no longer bound are dropped
const CONFIG_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Resolver that always presents one certificate
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Cached TLS config, valid while the certificate it was built from is current
struct CachedConfig {
    certificate: Arc<CertifiedKey>,
    config: Arc<ServerConfig>,
}

pub struct HttpsServer {
    listener: TcpListener,
    ctx: RouteContext,
    certificates: CertificateManager,
    configs: Arc<DashMap<String, CachedConfig>>,
}

impl HttpsServer {
    pub async fn bind(
        addr: SocketAddr,
        ctx: RouteContext,
        certificates: CertificateManager,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(Self {
            listener,
            ctx,
            certificates,
            configs: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let local_addr = self.local_addr()?;
        info!("HTTPS server listening on {}", local_addr);

        let mut prune = tokio::time::interval(CONFIG_PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = prune.tick() => {
                    let registry = &self.ctx.registry;
                    prune_configs(&self.configs, |hostname| registry.get(hostname).is_some());
                    continue;
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let ctx = self.ctx.clone();
                    let certificates = self.certificates.clone();
                    let configs = self.configs.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, peer_addr, ctx, certificates, configs).await
                        {
                            debug!(peer = %peer_addr, "HTTPS connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTPS connection: {}", e);
                }
            }
        }

        info!("HTTPS server on {} stopped", local_addr);
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: RouteContext,
    certificates: CertificateManager,
    configs: Arc<DashMap<String, CachedConfig>>,
) -> Result<(), ServerError> {
    let start = match timeout(
        ctx.head_timeout,
        LazyConfigAcceptor::new(Acceptor::default(), stream),
    )
    .await
    {
        Ok(start) => start?,
        Err(_) => {
            debug!(peer = %peer_addr, "Timed out waiting for ClientHello");
            return Ok(());
        }
    };

    let Some(sni) = start
        .client_hello()
        .server_name()
        .map(|name| name.trim_end_matches('.').to_ascii_lowercase())
    else {
        debug!(peer = %peer_addr, "TLS handshake without SNI");
        return Ok(());
    };

    // Only registered hostnames get certificates
    if ctx.registry.get(&sni).is_none() {
        debug!(peer = %peer_addr, hostname = %sni, outcome = "route_miss", "SNI not registered");
        return Ok(());
    }

    let certificate = match certificates.certificate_for(&sni).await {
        Ok(certificate) => certificate,
        Err(e) => {
            warn!(
                peer = %peer_addr,
                hostname = %sni,
                outcome = "certificate_issuance_failed",
                "Aborting TLS handshake: {}",
                e
            );
            return Ok(());
        }
    };

    let config = server_config_for(&configs, &sni, certificate)?;
    let tls = match timeout(ctx.head_timeout, start.into_stream(config)).await {
        Ok(tls) => tls?,
        Err(_) => {
            debug!(peer = %peer_addr, hostname = %sni, "TLS handshake timed out");
            return Ok(());
        }
    };
    debug!(peer = %peer_addr, hostname = %sni, "TLS handshake completed");

    serve_tls_connection(tls, peer_addr, &ctx, &sni).await
}

/// Drop cached configs for hostnames that are no longer bound
fn prune_configs(configs: &DashMap<String, CachedConfig>, is_bound: impl Fn(&str) -> bool) {
    let before = configs.len();
    configs.retain(|hostname, _| is_bound(hostname));
    let pruned = before.saturating_sub(configs.len());
    if pruned > 0 {
        debug!(pruned, "Dropped TLS configs of unbound hostnames");
    }
}

fn server_config_for(
    configs: &DashMap<String, CachedConfig>,
    hostname: &str,
    certificate: Arc<CertifiedKey>,
) -> Result<Arc<ServerConfig>, ServerError> {
    if let Some(cached) = configs.get(hostname) {
        if Arc::ptr_eq(&cached.certificate, &certificate) {
            return Ok(cached.config.clone());
        }
    }

    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ServerError::Tls(e.to_string()))?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(FixedCert(certificate.clone())));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let config = Arc::new(config);
    configs.insert(
        hostname.to_string(),
        CachedConfig {
            certificate,
            config: config.clone(),
        },
    );
    Ok(config)
}
