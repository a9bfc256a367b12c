//! Relay lifecycle: bind every listener, then serve until shutdown

use porcupine_auth::{CredentialStore, HostIdentity, SessionAuthenticator};
use porcupine_cert::{
    AcmeAuthority, AcmeConfig, CertManagerConfig, CertificateManager, CertificateStore,
    Http01ChallengeStore, SelfSignedAuthority,
};
use porcupine_control::{ControlHandler, Forwarder, Registry};
use porcupine_server_http::{HttpServer, HttpsServer, RouteContext, ServerError};
use porcupine_transport::TransportListener;
use porcupine_transport_quic::{QuicConfig, QuicListener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{RelayConfig, RelayError};

/// A relay with every listener bound
pub struct Relay {
    config: RelayConfig,
    registry: Arc<Registry>,
    handler: ControlHandler,
    quic: QuicListener,
    http: HttpServer,
    https: Option<HttpsServer>,
    certificates: Option<CertificateManager>,
    host_identity: HostIdentity,
    control_addr: SocketAddr,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Load credentials and bind all listeners
    ///
    /// Any bind failure is returned here; nothing is served until [`run`](Self::run).
    pub async fn bind(config: RelayConfig) -> Result<Self, RelayError> {
        let credentials = Arc::new(CredentialStore::load(&config.authorized_keys)?);
        info!(
            path = %config.authorized_keys.display(),
            keys = credentials.len(),
            "Loaded authorized keys"
        );

        let host_identity = HostIdentity::resolve(
            config.host_cert.clone(),
            config.host_key.clone(),
            &config.data_dir,
            &config.host_names,
        )?;

        let control_error = |e: porcupine_transport::TransportError| RelayError::ControlBind {
            address: config.control_addr.to_string(),
            reason: e.to_string(),
        };
        let quic_config = QuicConfig::server_default(&host_identity.cert_path, &host_identity.key_path)
            .map_err(control_error)?;
        let quic = QuicListener::new(config.control_addr, Arc::new(quic_config)).map_err(control_error)?;
        let control_addr = quic.local_addr().map_err(control_error)?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(Registry::new());
        let handler = ControlHandler::new(
            registry.clone(),
            Arc::new(SessionAuthenticator::new(credentials)),
        )
        .with_config(config.control.clone())
        .with_shutdown(shutdown.clone());
        let forwarder = Forwarder::new(registry.clone());

        let mut http_ctx = RouteContext::new(registry.clone(), forwarder.clone());
        let certificates = if config.tls_enabled() {
            let (manager, challenges) = certificate_manager(&config, registry.clone()).await?;
            if let Some(challenges) = challenges {
                http_ctx = http_ctx.with_challenges(challenges);
            }
            Some(manager)
        } else {
            None
        };

        let http = HttpServer::bind(config.http_addr, http_ctx).await?;
        let http_addr = http.local_addr()?;

        let https = match (config.https_addr, &certificates) {
            (Some(addr), Some(manager)) => Some(
                HttpsServer::bind(
                    addr,
                    RouteContext::new(registry.clone(), forwarder),
                    manager.clone(),
                )
                .await?,
            ),
            _ => None,
        };
        let https_addr = https
            .as_ref()
            .map(HttpsServer::local_addr)
            .transpose()?;

        Ok(Self {
            config,
            registry,
            handler,
            quic,
            http,
            https,
            certificates,
            host_identity,
            control_addr,
            http_addr,
            https_addr,
            shutdown,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn host_identity(&self) -> &HostIdentity {
        &self.host_identity
    }

    pub fn certificates(&self) -> Option<&CertificateManager> {
        self.certificates.as_ref()
    }

    /// Cancelling this token stops [`run`](Self::run) and ends every session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token fires
    pub async fn run(self) -> Result<(), RelayError> {
        let Relay {
            config,
            handler,
            quic,
            http,
            https,
            certificates,
            host_identity,
            control_addr,
            http_addr,
            https_addr,
            shutdown,
            ..
        } = self;

        let http_task = tokio::spawn(http.run(shutdown.clone()));
        let https_task = https.map(|server| tokio::spawn(server.run(shutdown.clone())));
        let renewal_task = certificates
            .as_ref()
            .map(|manager| manager.spawn_renewal(config.renewal_interval, shutdown.child_token()));

        info!(
            control = %control_addr,
            http = %http_addr,
            https = ?https_addr,
            host_cert = %host_identity.cert_path.display(),
            "Relay is running"
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = quic.accept() => accepted,
            };

            match accepted {
                Ok((connection, peer_addr)) => {
                    debug!(peer = %peer_addr, "Tunnel connection accepted");
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle_connection(Arc::new(connection), peer_addr).await;
                    });
                }
                Err(e) => {
                    // Only returned once the endpoint is closed
                    error!("Control endpoint stopped accepting: {}", e);
                    shutdown.cancel();
                    break;
                }
            }
        }

        info!("Relay shutting down");
        quic.close().await;

        join_listener("HTTP", http_task).await;
        if let Some(task) = https_task {
            join_listener("HTTPS", task).await;
        }
        if let Some(task) = renewal_task {
            let _ = task.await;
        }

        info!("Relay stopped");
        Ok(())
    }
}

async fn join_listener(name: &str, task: JoinHandle<Result<(), ServerError>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} listener failed: {}", name, e),
        Err(e) => error!("{} listener task panicked: {}", name, e),
    }
}

/// ACME-backed manager (with the challenge store the HTTP listener must serve),
/// or a self-signed one for development
///
/// Certificates of hostnames that are no longer bound are dropped by the
/// renewal sweep rather than renewed.
async fn certificate_manager(
    config: &RelayConfig,
    registry: Arc<Registry>,
) -> Result<(CertificateManager, Option<Http01ChallengeStore>), RelayError> {
    let bound = move |hostname: &str| registry.get(hostname).is_some();

    if config.self_signed {
        warn!("Issuing self-signed certificates; browsers will not trust them");
        let manager = CertificateManager::new(
            Arc::new(SelfSignedAuthority::new()),
            CertManagerConfig::default(),
        )
        .with_retention(bound);
        return Ok((manager, None));
    }

    let challenges = Http01ChallengeStore::new();
    let mut acme = AcmeConfig::new(config.cert_dir.clone()).with_staging(config.acme_staging);
    if let Some(email) = &config.acme_email {
        acme = acme.with_email(email.clone());
    }
    info!(
        directory = acme.directory_url(),
        email = config.acme_email.as_deref().unwrap_or("<none>"),
        "Using ACME for certificates"
    );

    let manager = CertificateManager::new(
        Arc::new(AcmeAuthority::new(acme, challenges.clone())),
        CertManagerConfig::default(),
    )
    .with_store(CertificateStore::new(config.cert_dir.clone()))
    .with_retention(bound);

    let loaded = manager.load_stored().await?;
    info!(loaded, dir = %config.cert_dir.display(), "Loaded stored certificates");

    Ok((manager, Some(challenges)))
}
