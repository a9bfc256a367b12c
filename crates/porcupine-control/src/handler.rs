//! Control-plane handler: one task per client session

use porcupine_auth::{AuthError, AuthenticatedKey, SessionAuthenticator};
use porcupine_proto::{canonicalize_hostname, BindRejection, TunnelMessage, PROTOCOL_VERSION};
use porcupine_router::{RegistryError, TunnelRecord};
use porcupine_transport::{close_code, TransportConnection, TransportError, TransportStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{ChannelOpener, Session};
use crate::Registry;

/// How long a final reply may take to reach the client before the connection closes
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Control handler errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("No pong within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl ControlError {
    fn close_code(&self) -> u32 {
        match self {
            ControlError::Auth(_) | ControlError::HandshakeTimeout => close_code::AUTH_REJECTED,
            ControlError::HeartbeatTimeout(_) => close_code::HEARTBEAT_TIMEOUT,
            ControlError::Protocol(_) => close_code::PROTOCOL_ERROR,
            ControlError::Transport(_) => close_code::NORMAL,
        }
    }
}

/// Control plane timing
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Deadline for the whole authentication handshake
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a session loop ended normally
enum SessionEnd {
    Disconnected(String),
    StreamClosed,
    Shutdown,
}

/// Handles incoming client sessions
#[derive(Clone)]
pub struct ControlHandler {
    registry: Arc<Registry>,
    authenticator: Arc<SessionAuthenticator>,
    config: ControlConfig,
    shutdown: CancellationToken,
}

impl ControlHandler {
    pub fn new(registry: Arc<Registry>, authenticator: Arc<SessionAuthenticator>) -> Self {
        Self {
            registry,
            authenticator,
            config: ControlConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: ControlConfig) -> Self {
        self.config = config;
        self
    }

    /// Parent token; cancelling it ends every session
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Drive one client connection from handshake to cleanup
    pub async fn handle_connection<C>(&self, connection: Arc<C>, peer_addr: SocketAddr)
    where
        C: TransportConnection + 'static,
    {
        debug!(peer = %peer_addr, connection_id = %connection.connection_id(), "New tunnel connection");

        let deadline = Instant::now() + self.config.auth_timeout;

        let mut control = match tokio::time::timeout_at(deadline, connection.accept_stream()).await {
            Ok(Ok(Some(stream))) => stream,
            Ok(Ok(None)) => {
                debug!(peer = %peer_addr, "Connection closed before control stream was opened");
                return;
            }
            Ok(Err(e)) => {
                warn!(peer = %peer_addr, "Failed to accept control stream: {}", e);
                connection.close(close_code::PROTOCOL_ERROR, "no control stream").await;
                return;
            }
            Err(_) => {
                warn!(peer = %peer_addr, "No control stream within handshake deadline");
                connection
                    .close(close_code::AUTH_REJECTED, "authentication rejected")
                    .await;
                return;
            }
        };

        let handshake = tokio::time::timeout_at(deadline, self.authenticate(&mut control)).await;
        let key = match handshake {
            Ok(Ok(key)) => key,
            outcome => {
                let err = match outcome {
                    Ok(Err(e)) => e,
                    _ => ControlError::HandshakeTimeout,
                };
                warn!(peer = %peer_addr, outcome = "auth_rejected", "Authentication failed: {}", err);
                let _ = control.send_message(&TunnelMessage::AuthRejected).await;
                let _ = control.finish().await;
                // Returns once the client hangs up
                let _ = tokio::time::timeout(CLOSE_LINGER, control.recv_message()).await;
                connection
                    .close(close_code::AUTH_REJECTED, "authentication rejected")
                    .await;
                return;
            }
        };

        let opener: Arc<dyn ChannelOpener> = connection.clone();
        let session = Arc::new(Session::new(
            key.fingerprint.clone(),
            peer_addr,
            opener,
            self.shutdown.child_token(),
        ));

        if let Err(e) = control
            .send_message(&TunnelMessage::Authenticated {
                session_id: session.id().to_string(),
            })
            .await
        {
            warn!(session_id = %session.id(), "Failed to confirm authentication: {}", e);
            session.cancel();
            connection.close(close_code::NORMAL, "control stream lost").await;
            return;
        }

        info!(
            session_id = %session.id(),
            fingerprint = %key.fingerprint,
            peer = %peer_addr,
            "Session authenticated"
        );

        let result = self.run_session(&session, &mut control).await;

        // Registry first, so no new channel can be opened on a dying session
        let released = self.registry.remove_all_owned_by(session.id());
        session.cancel();

        let (code, reason) = match &result {
            Ok(SessionEnd::Disconnected(reason)) => {
                info!(session_id = %session.id(), reason = %reason, released = ?released, "Session disconnected");
                (close_code::NORMAL, "client disconnected".to_string())
            }
            Ok(SessionEnd::StreamClosed) => {
                info!(session_id = %session.id(), released = ?released, "Control stream closed");
                (close_code::NORMAL, "control stream closed".to_string())
            }
            Ok(SessionEnd::Shutdown) => {
                info!(session_id = %session.id(), released = ?released, "Session ended by relay shutdown");
                (close_code::NORMAL, "relay shutting down".to_string())
            }
            Err(e) => {
                warn!(session_id = %session.id(), released = ?released, "Session ended with error: {}", e);
                (e.close_code(), e.to_string())
            }
        };

        let stats = connection.stats();
        debug!(
            session_id = %session.id(),
            connection_id = %connection.connection_id(),
            uptime_secs = stats.uptime_secs,
            rtt_ms = ?stats.rtt_ms,
            lost_packets = stats.lost_packets,
            datagrams_sent = stats.datagrams_sent,
            "Session transport stats"
        );
        connection.close(code, &reason).await;
    }

    /// Challenge–response over the control stream
    async fn authenticate<S>(&self, control: &mut S) -> Result<AuthenticatedKey, ControlError>
    where
        S: TransportStream + ?Sized,
    {
        let (protocol_version, public_key) = match control.recv_message().await? {
            Some(TunnelMessage::Hello {
                protocol_version,
                public_key,
            }) => (protocol_version, public_key),
            Some(other) => {
                return Err(ControlError::Protocol(format!(
                    "expected hello, got {}",
                    other.kind()
                )))
            }
            None => return Err(TransportError::StreamClosed.into()),
        };

        // Always challenge, whether or not the key is known
        let nonce = self.authenticator.challenge();
        control
            .send_message(&TunnelMessage::Challenge {
                nonce: nonce.to_vec(),
            })
            .await?;

        let signature = match control.recv_message().await? {
            Some(TunnelMessage::Authenticate { signature }) => signature,
            Some(other) => {
                return Err(ControlError::Protocol(format!(
                    "expected authenticate, got {}",
                    other.kind()
                )))
            }
            None => return Err(TransportError::StreamClosed.into()),
        };

        if protocol_version != PROTOCOL_VERSION {
            debug!(protocol_version, "Unsupported protocol version");
            return Err(AuthError::Rejected.into());
        }

        Ok(self.authenticator.verify(&public_key, &nonce, &signature)?)
    }

    async fn run_session<S>(
        &self,
        session: &Arc<Session>,
        control: &mut S,
    ) -> Result<SessionEnd, ControlError>
    where
        S: TransportStream + ?Sized,
    {
        let cancel = session.cancel_token();
        let mut bound: Option<String> = None;

        let mut interval = tokio::time::interval(self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately
        interval.tick().await;

        let mut waiting_for_pong = false;
        let mut pong_deadline = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),

                _ = interval.tick(), if !waiting_for_pong => {
                    control.send_message(&TunnelMessage::Ping { timestamp: unix_millis() }).await?;
                    waiting_for_pong = true;
                    pong_deadline = Instant::now() + self.config.pong_timeout;
                }

                _ = tokio::time::sleep_until(pong_deadline), if waiting_for_pong => {
                    return Err(ControlError::HeartbeatTimeout(self.config.pong_timeout));
                }

                result = control.recv_message() => {
                    let message = match result? {
                        Some(message) => message,
                        None => return Ok(SessionEnd::StreamClosed),
                    };

                    match message {
                        TunnelMessage::Pong { .. } => {
                            waiting_for_pong = false;
                        }
                        TunnelMessage::Ping { timestamp } => {
                            control.send_message(&TunnelMessage::Pong { timestamp }).await?;
                        }
                        TunnelMessage::Bind { hostname, local_port } => {
                            let reply = self.handle_bind(session, &mut bound, hostname, local_port);
                            control.send_message(&reply).await?;
                        }
                        TunnelMessage::Unbind { hostname } => {
                            let reply = self.handle_unbind(session, &mut bound, hostname);
                            control.send_message(&reply).await?;
                        }
                        TunnelMessage::Disconnect { reason } => {
                            if let Err(e) = control.send_message(&TunnelMessage::DisconnectAck).await {
                                debug!(session_id = %session.id(), "Failed to acknowledge disconnect: {}", e);
                            }
                            let _ = control.finish().await;
                            let _ = tokio::time::timeout(CLOSE_LINGER, control.recv_message()).await;
                            return Ok(SessionEnd::Disconnected(reason));
                        }
                        other => {
                            return Err(ControlError::Protocol(format!(
                                "unexpected {} on control stream",
                                other.kind()
                            )));
                        }
                    }
                }
            }
        }
    }

    fn handle_bind(
        &self,
        session: &Arc<Session>,
        bound: &mut Option<String>,
        hostname: String,
        local_port: u16,
    ) -> TunnelMessage {
        let canonical = match canonicalize_hostname(&hostname) {
            Ok(canonical) => canonical,
            Err(e) => {
                info!(session_id = %session.id(), hostname = %hostname, "Bind rejected: {}", e);
                return TunnelMessage::BindRejected {
                    hostname,
                    reason: BindRejection::InvalidHostname,
                };
            }
        };

        let record = TunnelRecord::new(canonical.clone(), session.id(), session, local_port);
        match self.registry.put(record) {
            Ok(_) => {
                if let Some(previous) = bound.replace(canonical.clone()) {
                    if previous != canonical && self.registry.remove_if_owner(&previous, session.id()) {
                        info!(session_id = %session.id(), hostname = %previous, "Released previous binding");
                    }
                }

                info!(
                    session_id = %session.id(),
                    hostname = %canonical,
                    local_port,
                    "Hostname bound"
                );
                TunnelMessage::BindAccepted {
                    hostname: canonical,
                    token: Uuid::new_v4().to_string(),
                }
            }
            Err(RegistryError::HostnameConflict { owner, .. }) => {
                warn!(
                    session_id = %session.id(),
                    hostname = %canonical,
                    owner = %owner,
                    "Bind rejected: hostname in use"
                );
                TunnelMessage::BindRejected {
                    hostname: canonical,
                    reason: BindRejection::HostnameConflict,
                }
            }
        }
    }

    fn handle_unbind(
        &self,
        session: &Arc<Session>,
        bound: &mut Option<String>,
        hostname: String,
    ) -> TunnelMessage {
        let canonical = hostname.to_ascii_lowercase();

        if self.registry.remove_if_owner(&canonical, session.id()) {
            info!(session_id = %session.id(), hostname = %canonical, "Hostname unbound");
        }
        if bound.as_deref() == Some(canonical.as_str()) {
            *bound = None;
        }

        TunnelMessage::Unbound { hostname: canonical }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
