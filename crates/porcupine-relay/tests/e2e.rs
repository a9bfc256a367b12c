//! End-to-end: real QUIC control sessions and real TCP public connections

use porcupine_auth::ClientIdentity;
use porcupine_cert::CertificateManager;
use porcupine_client::{
    quic_connector, ClientConfig, ClientError, ClientState, TunnelClient,
};
use porcupine_control::Registry;
use porcupine_proto::BindRejection;
use porcupine_relay::{Relay, RelayConfig};
use porcupine_transport_quic::QuicConnector;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const LOCAL_BODY: &str = "hello from the private side";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct RunningRelay {
    _dir: TempDir,
    control_addr: SocketAddr,
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    host_cert: PathBuf,
    registry: Arc<Registry>,
    certificates: Option<CertificateManager>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), porcupine_relay::RelayError>>,
}

async fn start_relay(authorized: &[&ClientIdentity], https: bool) -> RunningRelay {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let keys: String = authorized
        .iter()
        .map(|identity| format!("{}\n", identity.authorized_keys_line("test")))
        .collect();
    std::fs::write(dir.path().join("authorized_keys"), keys).unwrap();

    let mut config = RelayConfig::local(dir.path());
    if https {
        config.https_addr = Some("127.0.0.1:0".parse().unwrap());
    }

    let relay = Relay::bind(config).await.unwrap();
    RunningRelay {
        control_addr: relay.control_addr(),
        http_addr: relay.http_addr(),
        https_addr: relay.https_addr(),
        host_cert: relay.host_identity().cert_path.clone(),
        registry: relay.registry().clone(),
        certificates: relay.certificates().cloned(),
        shutdown: relay.shutdown_token(),
        task: tokio::spawn(relay.run()),
        _dir: dir,
    }
}

impl RunningRelay {
    fn client_config(&self, hostname: &str, local_port: u16) -> ClientConfig {
        ClientConfig::builder()
            .relay_addr(self.control_addr.to_string())
            .hostname(hostname)
            .local_host("127.0.0.1")
            .local_port(local_port)
            .relay_cert(Some(self.host_cert.clone()))
            .max_retries(1)
            .retry_delay(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    fn client(&self, identity: ClientIdentity, hostname: &str, local_port: u16) -> TunnelClient<QuicConnector> {
        let config = self.client_config(hostname, local_port);
        let connector = quic_connector(&config).unwrap();
        TunnelClient::new(config, identity, connector)
    }

    /// Start a client and wait until its hostname is bound
    async fn connect(
        &self,
        identity: ClientIdentity,
        hostname: &str,
        local_port: u16,
    ) -> (Arc<TunnelClient<QuicConnector>>, JoinHandle<Result<(), ClientError>>) {
        let client = Arc::new(self.client(identity, hostname, local_port));
        let mut state = client.subscribe();
        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.run().await })
        };
        timeout(
            Duration::from_secs(10),
            state.wait_for(|s| matches!(s, ClientState::Forwarding { .. })),
        )
        .await
        .expect("tunnel should come up")
        .unwrap();
        (client, task)
    }
}

/// Local HTTP service; counts the connections it receives
async fn local_service() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    LOCAL_BODY.len(),
                    LOCAL_BODY
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (port, hits)
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn exchange<IO: AsyncRead + AsyncWrite + Unpin>(mut io: IO, host: &str) -> String {
    let request = format!("GET /index.html HTTP/1.1\r\nHost: {}\r\nAccept: */*\r\n\r\n", host);
    io.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(10), io.read_to_end(&mut response))
        .await
        .expect("response should complete")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

async fn get(addr: SocketAddr, host: &str) -> String {
    exchange(TcpStream::connect(addr).await.unwrap(), host).await
}

fn body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

#[tokio::test]
async fn http_request_reaches_local_service() {
    let identity = ClientIdentity::generate();
    let relay = start_relay(&[&identity], false).await;
    let (port, hits) = local_service().await;
    let (client, _task) = relay.connect(identity, "test.local", port).await;

    let response = get(relay.http_addr, "test.local").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert_eq!(body(&response), LOCAL_BODY);

    // Case and port in the Host header do not matter
    let response = get(relay.http_addr, "Test.Local:8080").await;
    assert_eq!(body(&response), LOCAL_BODY);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    client.shutdown().await;
}

#[tokio::test]
async fn unknown_host_is_not_proxied() {
    let identity = ClientIdentity::generate();
    let relay = start_relay(&[&identity], false).await;
    let (port, hits) = local_service().await;
    let (_client, _task) = relay.connect(identity, "test.local", port).await;

    let response = get(relay.http_addr, "unknown.local").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn local_service_down_gives_502_and_keeps_binding() {
    let identity = ClientIdentity::generate();
    let relay = start_relay(&[&identity], false).await;
    let port = closed_port().await;
    let (_client, _task) = relay.connect(identity, "test.local", port).await;

    let response = get(relay.http_addr, "test.local").await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway"), "{}", response);
    assert_eq!(body(&response), "Bad Gateway");
    assert!(relay.registry.get("test.local").is_some());
}

#[tokio::test]
async fn unauthorized_client_is_rejected() {
    let authorized = ClientIdentity::generate();
    let relay = start_relay(&[&authorized], false).await;

    let client = relay.client(ClientIdentity::generate(), "test.local", 3000);
    let result = timeout(Duration::from_secs(10), client.run()).await.unwrap();

    assert!(matches!(result, Err(ClientError::AuthRejected)), "{:?}", result);
    assert!(relay.registry.is_empty());
}

#[tokio::test]
async fn second_client_cannot_take_bound_hostname() {
    let first = ClientIdentity::generate();
    let second = ClientIdentity::generate();
    let relay = start_relay(&[&first, &second], false).await;
    let (port, _hits) = local_service().await;
    let (_owner, _task) = relay.connect(first, "test.local", port).await;
    let owner_session = relay.registry.get("test.local").unwrap().session_id;

    let contender = relay.client(second, "test.local", port);
    let result = timeout(Duration::from_secs(10), contender.run()).await.unwrap();

    assert!(
        matches!(
            result,
            Err(ClientError::BindRejected {
                reason: BindRejection::HostnameConflict,
                ..
            })
        ),
        "{:?}",
        result
    );
    assert_eq!(relay.registry.get("test.local").unwrap().session_id, owner_session);
}

#[tokio::test]
async fn client_shutdown_releases_route() {
    let identity = ClientIdentity::generate();
    let relay = start_relay(&[&identity], false).await;
    let (port, _hits) = local_service().await;
    let (client, task) = relay.connect(identity, "test.local", port).await;

    client.shutdown().await;
    assert!(task.await.unwrap().is_ok());

    timeout(Duration::from_secs(5), async {
        while relay.registry.get("test.local").is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("route released");

    let response = get(relay.http_addr, "test.local").await;
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));
}

#[tokio::test]
async fn https_terminates_tls_for_bound_hostname() {
    let identity = ClientIdentity::generate();
    let relay = start_relay(&[&identity], true).await;
    let (port, _hits) = local_service().await;
    let (_client, _task) = relay.connect(identity, "secure.local", port).await;

    let certificates = relay.certificates.as_ref().unwrap();
    let issued = certificates.certificate_for("secure.local").await.unwrap();
    let mut roots = rustls::RootCertStore::empty();
    roots.add(issued.cert[0].clone()).unwrap();
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect(relay.https_addr.unwrap()).await.unwrap();
    let name = rustls::pki_types::ServerName::try_from("secure.local").unwrap();
    let tls = connector.connect(name, tcp).await.unwrap();

    let response = exchange(tls, "secure.local").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert_eq!(body(&response), LOCAL_BODY);
}

#[tokio::test]
async fn relay_shutdown_ends_sessions() {
    let identity = ClientIdentity::generate();
    let relay = start_relay(&[&identity], false).await;
    let (port, _hits) = local_service().await;
    let (client, _task) = relay.connect(identity, "test.local", port).await;
    let mut state = client.subscribe();

    relay.shutdown.cancel();
    let stopped = timeout(Duration::from_secs(5), relay.task).await.expect("relay stops");
    assert!(stopped.unwrap().is_ok());

    timeout(Duration::from_secs(5), async {
        while !relay.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sessions cleaned up");

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| !matches!(s, ClientState::Forwarding { .. })),
    )
    .await
    .expect("client notices")
    .unwrap();
}
