//! Tunnel client against a real control handler over the in-memory transport

use async_trait::async_trait;
use porcupine_auth::{ClientIdentity, CredentialStore, SessionAuthenticator};
use porcupine_client::{ClientConfig, ClientError, ClientState, TunnelClient};
use porcupine_control::{ControlConfig, ControlHandler, ForwardError, Forwarder, Registry};
use porcupine_proto::{BindRejection, TunnelMessage};
use porcupine_transport::memory::{memory_connection_pair, MemoryConnection, MemoryStream};
use porcupine_transport::{
    ConnectionStats, TransportConnection, TransportConnector, TransportError, TransportResult,
    TransportStream,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Connects by handing the server half of a memory pair to a control handler
struct MemoryConnector {
    handler: Option<ControlHandler>,
    attempts: AtomicUsize,
    /// Server halves of every connection made, in order
    sessions: Mutex<Vec<Arc<MemoryConnection>>>,
}

impl MemoryConnector {
    fn new(handler: ControlHandler) -> Self {
        Self {
            handler: Some(handler),
            attempts: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Every connection attempt fails
    fn unreachable() -> Self {
        Self {
            handler: None,
            attempts: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn session(&self, index: usize) -> Arc<MemoryConnection> {
        self.sessions.lock().unwrap()[index].clone()
    }
}

impl std::fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnector")
            .field("attempts", &self.attempts())
            .finish()
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self, addr: SocketAddr, _server_name: &str) -> TransportResult<MemoryConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let Some(handler) = self.handler.clone() else {
            return Err(TransportError::ConnectionError("connection refused".to_string()));
        };

        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let (client, server) = memory_connection_pair(peer, addr);
        let server = Arc::new(server);
        self.sessions.lock().unwrap().push(server.clone());
        tokio::spawn(async move { handler.handle_connection(server, peer).await });
        Ok(client)
    }
}

struct Relay {
    registry: Arc<Registry>,
    handler: ControlHandler,
}

impl Relay {
    fn new(authorized: &[&ClientIdentity]) -> Self {
        Self::with_config(authorized, ControlConfig::default())
    }

    fn with_config(authorized: &[&ClientIdentity], config: ControlConfig) -> Self {
        let store = CredentialStore::from_keys(authorized.iter().map(|i| i.public_key_base64()));
        let registry = Arc::new(Registry::new());
        let handler = ControlHandler::new(
            registry.clone(),
            Arc::new(SessionAuthenticator::new(Arc::new(store))),
        )
        .with_config(config);
        Self { registry, handler }
    }
}

fn config(hostname: &str, local_port: u16) -> ClientConfig {
    ClientConfig::builder()
        .relay_addr("127.0.0.1:2222")
        .hostname(hostname)
        .local_host("127.0.0.1")
        .local_port(local_port)
        .max_retries(3)
        .retry_delay(Duration::from_millis(20))
        .build()
        .unwrap()
}

/// Local service that answers with its input uppercased
async fn uppercase_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut input = Vec::new();
                socket.read_to_end(&mut input).await.unwrap();
                socket.write_all(&input.to_ascii_uppercase()).await.unwrap();
                socket.shutdown().await.unwrap();
            });
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_state(
    state: &mut watch::Receiver<ClientState>,
    predicate: impl FnMut(&ClientState) -> bool,
) -> ClientState {
    timeout(Duration::from_secs(5), state.wait_for(predicate))
        .await
        .expect("state change expected")
        .unwrap()
        .clone()
}

fn is_forwarding(state: &ClientState) -> bool {
    matches!(state, ClientState::Forwarding { .. })
}

#[tokio::test]
async fn binds_and_pairs_channels_with_local_service() {
    init_tracing();
    let identity = ClientIdentity::generate();
    let relay = Relay::new(&[&identity]);
    let port = uppercase_service().await;

    let client = Arc::new(TunnelClient::new(
        config("App.Example.com", port),
        identity,
        MemoryConnector::new(relay.handler.clone()),
    ));
    let mut state = client.subscribe();
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };

    let forwarding = wait_for_state(&mut state, is_forwarding).await;
    match forwarding {
        ClientState::Forwarding { hostname, .. } => assert_eq!(hostname, "app.example.com"),
        other => panic!("unexpected state {:?}", other),
    }

    let record = relay.registry.get("app.example.com").expect("bound");
    assert_eq!(record.local_port, port);

    let mut channel = Forwarder::new(relay.registry.clone()).open(&record).await.unwrap();
    let (mut near, mut far) = duplex(1024);
    far.shutdown().await.unwrap();
    let stats = channel.relay(&mut near, b"hello tunnel").await.unwrap();

    let mut output = Vec::new();
    far.read_to_end(&mut output).await.unwrap();
    assert_eq!(output, b"HELLO TUNNEL");
    assert_eq!(stats.bytes_from_tunnel, 12);

    client.shutdown().await;
    assert!(runner.await.unwrap().is_ok());
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn shutdown_releases_hostname() {
    let identity = ClientIdentity::generate();
    let relay = Relay::new(&[&identity]);
    let port = uppercase_service().await;

    let client = Arc::new(TunnelClient::new(
        config("app.example.com", port),
        identity,
        MemoryConnector::new(relay.handler.clone()),
    ));
    let mut state = client.subscribe();
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    wait_for_state(&mut state, is_forwarding).await;

    client.shutdown().await;
    assert!(runner.await.unwrap().is_ok());

    // Cleanup runs on the relay side after the acknowledgement
    timeout(Duration::from_secs(3), async {
        while relay.registry.get("app.example.com").is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("binding released");
}

#[tokio::test]
async fn local_service_down_refuses_channel() {
    let identity = ClientIdentity::generate();
    let relay = Relay::new(&[&identity]);
    let port = closed_port().await;

    let client = Arc::new(TunnelClient::new(
        config("app.example.com", port),
        identity,
        MemoryConnector::new(relay.handler.clone()),
    ));
    let mut state = client.subscribe();
    let _runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    wait_for_state(&mut state, is_forwarding).await;

    let record = relay.registry.get("app.example.com").unwrap();
    let result = Forwarder::new(relay.registry.clone()).open(&record).await;
    assert!(matches!(result, Err(ForwardError::UpstreamUnavailable(_))));

    // Refusal affects only that channel
    assert!(relay.registry.get("app.example.com").is_some());
    assert!(is_forwarding(&client.state()));
}

#[tokio::test]
async fn auth_rejection_is_terminal() {
    let identity = ClientIdentity::generate();
    let relay = Relay::new(&[]);
    let connector = MemoryConnector::new(relay.handler.clone());

    let client = TunnelClient::new(config("app.example.com", 3000), identity, connector);
    let result = timeout(Duration::from_secs(5), client.run()).await.unwrap();

    assert!(matches!(result, Err(ClientError::AuthRejected)));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(relay.registry.is_empty());
}

#[tokio::test]
async fn hostname_conflict_is_terminal() {
    let first = ClientIdentity::generate();
    let second = ClientIdentity::generate();
    let relay = Relay::new(&[&first, &second]);
    let port = uppercase_service().await;

    let owner = Arc::new(TunnelClient::new(
        config("app.example.com", port),
        first,
        MemoryConnector::new(relay.handler.clone()),
    ));
    let mut state = owner.subscribe();
    let _runner = {
        let owner = owner.clone();
        tokio::spawn(async move { owner.run().await })
    };
    wait_for_state(&mut state, is_forwarding).await;
    let owner_session = relay.registry.get("app.example.com").unwrap().session_id;

    let contender = TunnelClient::new(
        config("app.example.com", port),
        second,
        MemoryConnector::new(relay.handler.clone()),
    );
    let result = timeout(Duration::from_secs(5), contender.run()).await.unwrap();

    match result {
        Err(ClientError::BindRejected { hostname, reason }) => {
            assert_eq!(hostname, "app.example.com");
            assert_eq!(reason, BindRejection::HostnameConflict);
        }
        other => panic!("expected bind rejection, got {:?}", other),
    }
    assert_eq!(
        relay.registry.get("app.example.com").unwrap().session_id,
        owner_session
    );
}

#[tokio::test]
async fn retries_are_bounded() {
    let client = TunnelClient::new(
        config("app.example.com", 3000),
        ClientIdentity::generate(),
        MemoryConnector::unreachable(),
    );

    let result = timeout(Duration::from_secs(5), client.run()).await.unwrap();
    assert!(matches!(result, Err(ClientError::RetriesExhausted(3))));
}

#[tokio::test]
async fn retry_delay_is_fixed() {
    let client = Arc::new(TunnelClient::new(
        ClientConfig {
            retry_delay: Duration::from_millis(200),
            max_retries: 2,
            ..config("app.example.com", 3000)
        },
        ClientIdentity::generate(),
        MemoryConnector::unreachable(),
    ));

    let started = tokio::time::Instant::now();
    let result = client.run().await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(ClientError::RetriesExhausted(2))));
    assert!(elapsed >= Duration::from_millis(400), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
}

#[tokio::test]
async fn reconnects_after_connection_loss() {
    init_tracing();
    let identity = ClientIdentity::generate();
    let relay = Relay::new(&[&identity]);
    let port = uppercase_service().await;

    let client = Arc::new(TunnelClient::new(
        config("app.example.com", port),
        identity,
        MemoryConnector::new(relay.handler.clone()),
    ));
    let mut state = client.subscribe();
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    wait_for_state(&mut state, is_forwarding).await;

    let connector = client.connector();
    connector.session(0).close(0, "relay restart").await;

    timeout(Duration::from_secs(5), async {
        while connector.attempts() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("client should reconnect");
    wait_for_state(&mut state, is_forwarding).await;
    assert_eq!(connector.attempts(), 2);
    assert!(relay.registry.get("app.example.com").is_some());

    client.shutdown().await;
    assert!(runner.await.unwrap().is_ok());
}

#[tokio::test]
async fn answers_relay_heartbeats() {
    let identity = ClientIdentity::generate();
    let relay = Relay::with_config(
        &[&identity],
        ControlConfig {
            ping_interval: Duration::from_millis(30),
            pong_timeout: Duration::from_millis(100),
            ..Default::default()
        },
    );
    let port = uppercase_service().await;

    let client = Arc::new(TunnelClient::new(
        config("app.example.com", port),
        identity,
        MemoryConnector::new(relay.handler.clone()),
    ));
    let mut state = client.subscribe();
    let _runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    wait_for_state(&mut state, is_forwarding).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(is_forwarding(&client.state()));
    assert_eq!(client.connector().attempts(), 1);
    assert!(relay.registry.get("app.example.com").is_some());
}

/// Client-side view of a network path that can go dark
///
/// Once `severed` fires the client sees errors everywhere, but nothing is
/// closed or dropped towards the relay: its session lives on until the
/// heartbeat gives up.
#[derive(Debug)]
struct SeverableConnection {
    inner: Arc<MemoryConnection>,
    severed: CancellationToken,
    abandoned: Arc<Mutex<Vec<MemoryStream>>>,
}

#[derive(Debug)]
struct SeverableStream {
    inner: Option<MemoryStream>,
    severed: CancellationToken,
    abandoned: Arc<Mutex<Vec<MemoryStream>>>,
}

fn unreachable_path() -> TransportError {
    TransportError::ConnectionError("network unreachable".to_string())
}

impl SeverableConnection {
    fn wrap(&self, stream: MemoryStream) -> SeverableStream {
        SeverableStream {
            inner: Some(stream),
            severed: self.severed.clone(),
            abandoned: self.abandoned.clone(),
        }
    }
}

impl Drop for SeverableStream {
    fn drop(&mut self) {
        // Dropping would signal EOF to the relay
        if self.severed.is_cancelled() {
            if let Some(stream) = self.inner.take() {
                self.abandoned.lock().unwrap().push(stream);
            }
        }
    }
}

#[async_trait]
impl TransportStream for SeverableStream {
    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        if self.severed.is_cancelled() {
            return Err(unreachable_path());
        }
        let inner = self.inner.as_mut().ok_or(TransportError::StreamClosed)?;
        inner.send_message(message).await
    }

    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>> {
        let severed = self.severed.clone();
        let inner = self.inner.as_mut().ok_or(TransportError::StreamClosed)?;
        tokio::select! {
            biased;
            _ = severed.cancelled() => Err(unreachable_path()),
            message = inner.recv_message() => message,
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.severed.is_cancelled() {
            return Err(unreachable_path());
        }
        let inner = self.inner.as_mut().ok_or(TransportError::StreamClosed)?;
        inner.finish().await
    }

    fn stream_id(&self) -> u64 {
        self.inner.as_ref().map(|s| s.stream_id()).unwrap_or_default()
    }

    fn is_closed(&self) -> bool {
        self.severed.is_cancelled() || self.inner.as_ref().map_or(true, |s| s.is_closed())
    }
}

#[async_trait]
impl TransportConnection for SeverableConnection {
    type Stream = SeverableStream;

    async fn open_stream(&self) -> TransportResult<SeverableStream> {
        if self.severed.is_cancelled() {
            return Err(unreachable_path());
        }
        let stream = self.inner.open_stream().await?;
        Ok(self.wrap(stream))
    }

    async fn accept_stream(&self) -> TransportResult<Option<SeverableStream>> {
        tokio::select! {
            biased;
            _ = self.severed.cancelled() => Err(unreachable_path()),
            stream = self.inner.accept_stream() => Ok(stream?.map(|s| self.wrap(s))),
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        if !self.severed.is_cancelled() {
            self.inner.close(error_code, reason).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.severed.is_cancelled() || self.inner.is_closed()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn stats(&self) -> ConnectionStats {
        self.inner.stats()
    }

    fn connection_id(&self) -> String {
        self.inner.connection_id()
    }
}

/// Like [`MemoryConnector`], but every connection's path can be cut
#[derive(Debug)]
struct SeverableConnector {
    relay: MemoryConnector,
    paths: Mutex<Vec<CancellationToken>>,
    /// Client halves stay referenced so the relay never sees them go away
    clients: Mutex<Vec<Arc<MemoryConnection>>>,
    abandoned: Arc<Mutex<Vec<MemoryStream>>>,
}

impl SeverableConnector {
    fn new(handler: ControlHandler) -> Self {
        Self {
            relay: MemoryConnector::new(handler),
            paths: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
            abandoned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sever(&self, index: usize) {
        self.paths.lock().unwrap()[index].cancel();
    }
}

#[async_trait]
impl TransportConnector for SeverableConnector {
    type Connection = SeverableConnection;

    async fn connect(&self, addr: SocketAddr, server_name: &str) -> TransportResult<SeverableConnection> {
        let inner = Arc::new(self.relay.connect(addr, server_name).await?);
        let severed = CancellationToken::new();
        self.paths.lock().unwrap().push(severed.clone());
        self.clients.lock().unwrap().push(inner.clone());
        Ok(SeverableConnection {
            inner,
            severed,
            abandoned: self.abandoned.clone(),
        })
    }
}

#[tokio::test]
async fn rebinds_after_silent_network_drop() {
    init_tracing();
    let identity = ClientIdentity::generate();
    // The relay needs at least 200ms to notice the stale session
    let relay = Relay::with_config(
        &[&identity],
        ControlConfig {
            ping_interval: Duration::from_millis(200),
            pong_timeout: Duration::from_millis(200),
            ..Default::default()
        },
    );
    let port = uppercase_service().await;

    let client = Arc::new(TunnelClient::new(
        ClientConfig {
            retry_delay: Duration::from_millis(50),
            max_retries: 20,
            ..config("app.example.com", port)
        },
        identity,
        SeverableConnector::new(relay.handler.clone()),
    ));
    let mut state = client.subscribe();
    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    };
    wait_for_state(&mut state, is_forwarding).await;
    let stale_session = relay.registry.get("app.example.com").unwrap().session_id;

    client.connector().sever(0);
    wait_for_state(&mut state, |s| !is_forwarding(s)).await;

    let resumed = wait_for_state(&mut state, is_forwarding).await;
    let ClientState::Forwarding { session_id, .. } = resumed else {
        panic!("unexpected state {:?}", resumed);
    };

    // At least one reconnect hit the stale binding before it expired
    assert!(client.connector().relay.attempts() >= 3);
    assert!(!runner.is_finished());
    let record = relay.registry.get("app.example.com").expect("rebound");
    assert_eq!(record.session_id, session_id);
    assert_ne!(record.session_id, stale_session);

    client.shutdown().await;
    assert!(runner.await.unwrap().is_ok());
}
