//! Session lifecycle: handshake, bind, channel pairing and reconnects
//!
//! ```text
//! Disconnected ──run()──▶ Connecting ──auth──▶ Connected ──bind──▶ Forwarding
//!                            ▲                                         │
//!                            └──────────── transport error ────────────┘
//! ```
//!
//! Authentication and bind rejections end `run()` immediately. Other failures
//! are retried after a fixed delay until the retry budget is spent.

use porcupine_auth::ClientIdentity;
use porcupine_proto::{TunnelMessage, PROTOCOL_VERSION};
use porcupine_transport::{
    close_code, splice, TransportConnection, TransportConnector, TransportStream,
};
use porcupine_transport_quic::{QuicConfig, QuicConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::reconnect::{ReconnectError, ReconnectManager};
use crate::ClientError;

/// How long `shutdown` waits for the relay to acknowledge
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Connect, authenticate and bind must finish within this
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// `attempt` counts retries since the last established session
    Connecting { attempt: usize },
    Connected { session_id: String },
    Forwarding { session_id: String, hostname: String },
}

/// Build the QUIC connector described by `config`
pub fn quic_connector(config: &ClientConfig) -> Result<QuicConnector, ClientError> {
    let quic = if config.insecure {
        warn!("Relay certificate verification is disabled");
        QuicConfig::client_insecure()
    } else if let Some(path) = &config.relay_cert {
        QuicConfig::client_default().with_root_cert_file(path)?
    } else {
        QuicConfig::client_default()
    };
    Ok(QuicConnector::new(Arc::new(quic))?)
}

struct Established<T: TransportConnection> {
    connection: T,
    control: T::Stream,
    session_id: String,
    hostname: String,
}

pub struct TunnelClient<C> {
    config: Arc<ClientConfig>,
    identity: Arc<ClientIdentity>,
    connector: C,
    state: watch::Sender<ClientState>,
    shutdown: CancellationToken,
}

impl<C> TunnelClient<C>
where
    C: TransportConnector,
    C::Connection: 'static,
{
    pub fn new(config: ClientConfig, identity: ClientIdentity, connector: C) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            connector,
            state,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> ClientState {
        self.state.borrow().clone()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Disconnect gracefully and stop `run`
    ///
    /// The running session sends `Disconnect` and waits up to
    /// [`DISCONNECT_TIMEOUT`] for the acknowledgement.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.subscribe();
        let stopped = timeout(
            DISCONNECT_TIMEOUT + Duration::from_secs(1),
            state.wait_for(|s| *s == ClientState::Disconnected),
        )
        .await
        .is_ok();
        if !stopped {
            warn!("Tunnel client did not stop in time");
        }
    }

    /// Keep a tunnel up until shutdown or a terminal error
    pub async fn run(&self) -> Result<(), ClientError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect_config());
        let result = self.run_with_retries(&mut reconnect).await;
        self.set_state(ClientState::Disconnected);
        result
    }

    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    async fn run_with_retries(&self, reconnect: &mut ReconnectManager) -> Result<(), ClientError> {
        // After a silent drop the relay may still hold our previous session
        // until its heartbeat expires, so a conflict on rebind is retried.
        let mut bound_before = false;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            self.set_state(ClientState::Connecting {
                attempt: reconnect.attempt(),
            });

            match self.run_session(reconnect, &mut bound_before).await {
                Ok(()) => return Ok(()),
                Err(e) if bound_before && e.is_hostname_conflict() => {
                    warn!(
                        hostname = %self.config.hostname,
                        attempt = reconnect.attempt(),
                        "Hostname still held by the previous session, retrying"
                    );
                }
                Err(e) if e.is_terminal() => {
                    error!(hostname = %self.config.hostname, "Tunnel failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        hostname = %self.config.hostname,
                        attempt = reconnect.attempt(),
                        "Tunnel session ended: {}",
                        e
                    );
                }
            }

            self.set_state(ClientState::Connecting {
                attempt: reconnect.attempt() + 1,
            });
            match reconnect.wait(&self.shutdown).await {
                Ok(()) => {}
                Err(ReconnectError::Cancelled) => return Ok(()),
                Err(ReconnectError::MaxAttemptsReached) => {
                    let retries = reconnect.max_retries().unwrap_or_default();
                    error!(hostname = %self.config.hostname, retries, "Giving up on relay");
                    return Err(ClientError::RetriesExhausted(retries));
                }
            }
        }
    }

    async fn run_session(
        &self,
        reconnect: &mut ReconnectManager,
        bound_before: &mut bool,
    ) -> Result<(), ClientError> {
        let established = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            result = timeout(HANDSHAKE_TIMEOUT, self.establish()) => match result {
                Ok(established) => established?,
                Err(_) => return Err(ClientError::ConnectionLost("handshake timed out".to_string())),
            },
        };

        reconnect.reset();
        *bound_before = true;
        self.forward(established).await
    }

    async fn establish(&self) -> Result<Established<C::Connection>, ClientError> {
        let (addr, server_name) = self.config.resolve_relay().await?;
        debug!(relay = %addr, "Connecting to relay");

        let connection = self.connector.connect(addr, &server_name).await?;
        let mut control = connection.open_stream().await?;

        control
            .send_message(&TunnelMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                public_key: self.identity.public_key_base64(),
            })
            .await?;

        let nonce = match control.recv_message().await? {
            Some(TunnelMessage::Challenge { nonce }) => nonce,
            Some(TunnelMessage::AuthRejected) => return Err(rejected(&connection).await),
            other => return Err(unexpected("handshake", other)),
        };

        control
            .send_message(&TunnelMessage::Authenticate {
                signature: self.identity.sign_challenge(&nonce),
            })
            .await?;

        let session_id = match control.recv_message().await? {
            Some(TunnelMessage::Authenticated { session_id }) => session_id,
            Some(TunnelMessage::AuthRejected) => return Err(rejected(&connection).await),
            other => return Err(unexpected("handshake", other)),
        };

        info!(
            %session_id,
            relay = %addr,
            fingerprint = %self.identity.fingerprint(),
            "Authenticated with relay"
        );
        self.set_state(ClientState::Connected {
            session_id: session_id.clone(),
        });

        control
            .send_message(&TunnelMessage::Bind {
                hostname: self.config.hostname.clone(),
                local_port: self.config.local_port,
            })
            .await?;

        let hostname = loop {
            match control.recv_message().await? {
                Some(TunnelMessage::BindAccepted { hostname, token }) => {
                    debug!(%hostname, %token, "Bind accepted");
                    break hostname;
                }
                Some(TunnelMessage::BindRejected { hostname, reason }) => {
                    connection.close(close_code::NORMAL, "bind rejected").await;
                    return Err(ClientError::BindRejected { hostname, reason });
                }
                Some(TunnelMessage::Ping { timestamp }) => {
                    control.send_message(&TunnelMessage::Pong { timestamp }).await?;
                }
                other => return Err(unexpected("bind", other)),
            }
        };

        Ok(Established {
            connection,
            control,
            session_id,
            hostname,
        })
    }

    async fn forward(&self, established: Established<C::Connection>) -> Result<(), ClientError> {
        let Established {
            connection,
            mut control,
            session_id,
            hostname,
        } = established;

        info!(
            %session_id,
            %hostname,
            local = %self.config.local_addr(),
            "Tunnel established"
        );
        self.set_state(ClientState::Forwarding {
            session_id,
            hostname,
        });

        // Channels of this session stop with it
        let channels = CancellationToken::new();
        let _channels_guard = channels.clone().drop_guard();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    disconnect(&mut control).await;
                    connection.close(close_code::NORMAL, "client shutdown").await;
                    return Ok(());
                }

                message = control.recv_message() => match message? {
                    Some(TunnelMessage::Ping { timestamp }) => {
                        control.send_message(&TunnelMessage::Pong { timestamp }).await?;
                    }
                    Some(other) => {
                        debug!(kind = other.kind(), "Ignoring control message");
                    }
                    None => {
                        return Err(ClientError::ConnectionLost(
                            "relay closed the control stream".to_string(),
                        ));
                    }
                },

                accepted = connection.accept_stream() => match accepted? {
                    Some(stream) => {
                        let config = self.config.clone();
                        let cancel = channels.child_token();
                        tokio::spawn(async move {
                            handle_channel(stream, config, cancel).await;
                        });
                    }
                    None => {
                        return Err(ClientError::ConnectionLost(
                            "relay closed the connection".to_string(),
                        ));
                    }
                },
            }
        }
    }
}

async fn rejected<T: TransportConnection>(connection: &T) -> ClientError {
    connection
        .close(close_code::NORMAL, "authentication rejected")
        .await;
    ClientError::AuthRejected
}

fn unexpected(stage: &str, message: Option<TunnelMessage>) -> ClientError {
    match message {
        Some(message) => {
            ClientError::Protocol(format!("unexpected {} during {}", message.kind(), stage))
        }
        None => ClientError::ConnectionLost(format!("relay closed the stream during {}", stage)),
    }
}

/// Send `Disconnect` and wait briefly for the acknowledgement
async fn disconnect<S: TransportStream + ?Sized>(control: &mut S) {
    info!("Disconnecting from relay");
    let sent = control
        .send_message(&TunnelMessage::Disconnect {
            reason: "client shutdown".to_string(),
        })
        .await;
    if let Err(e) = sent {
        debug!("Failed to send disconnect: {}", e);
        return;
    }

    let acked = timeout(DISCONNECT_TIMEOUT, async {
        loop {
            match control.recv_message().await {
                Ok(Some(TunnelMessage::DisconnectAck)) => return true,
                Ok(Some(TunnelMessage::Ping { timestamp })) => {
                    let _ = control.send_message(&TunnelMessage::Pong { timestamp }).await;
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if !acked {
        warn!("Relay did not acknowledge disconnect");
    }
}

/// Pair one relay-opened channel with a new local connection
async fn handle_channel<S: TransportStream>(
    mut stream: S,
    config: Arc<ClientConfig>,
    cancel: CancellationToken,
) {
    let (channel_id, hostname) = match timeout(CHANNEL_OPEN_TIMEOUT, stream.recv_message()).await {
        Ok(Ok(Some(TunnelMessage::ChannelOpen {
            channel_id,
            hostname,
            ..
        }))) => (channel_id, hostname),
        Ok(Ok(Some(other))) => {
            debug!(kind = other.kind(), "Stream did not start with channel open");
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!("Failed to read channel open: {}", e);
            return;
        }
        Err(_) => {
            debug!("Timed out waiting for channel open");
            return;
        }
    };

    let mut local = match TcpStream::connect((config.local_host.as_str(), config.local_port)).await {
        Ok(local) => local,
        Err(e) => {
            warn!(
                channel_id,
                %hostname,
                local = %config.local_addr(),
                "Local service unavailable: {}",
                e
            );
            let _ = stream
                .send_message(&TunnelMessage::ChannelRefused {
                    channel_id,
                    reason: e.to_string(),
                })
                .await;
            let _ = stream.finish().await;
            return;
        }
    };

    if let Err(e) = stream
        .send_message(&TunnelMessage::ChannelAccepted { channel_id })
        .await
    {
        debug!(channel_id, "Failed to accept channel: {}", e);
        return;
    }

    match splice(&mut stream, &mut local, &cancel).await {
        Ok(stats) => debug!(
            channel_id,
            %hostname,
            bytes_in = stats.bytes_from_tunnel,
            bytes_out = stats.bytes_to_tunnel,
            "Channel closed"
        ),
        Err(e) => debug!(channel_id, %hostname, "Channel ended: {}", e),
    }
}
