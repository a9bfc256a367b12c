//! Per-connection routing shared by the HTTP and HTTPS listeners

use porcupine_cert::Http01ChallengeStore;
use porcupine_control::{Forwarder, Registry};
use porcupine_router::{parse_request_head, HostError, RequestHead, MAX_HEAD_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::response;
use crate::ServerError;

/// How long a caller may take to send its request head (and, on HTTPS, to
/// complete the TLS handshake)
pub const DEFAULT_HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a listener needs to route a request
#[derive(Clone)]
pub struct RouteContext {
    pub registry: Arc<Registry>,
    pub forwarder: Forwarder,
    /// Served on plain HTTP only
    pub challenges: Option<Http01ChallengeStore>,
    pub head_timeout: Duration,
}

impl RouteContext {
    pub fn new(registry: Arc<Registry>, forwarder: Forwarder) -> Self {
        Self {
            registry,
            forwarder,
            challenges: None,
            head_timeout: DEFAULT_HEAD_TIMEOUT,
        }
    }

    pub fn with_challenges(mut self, challenges: Http01ChallengeStore) -> Self {
        self.challenges = Some(challenges);
        self
    }

    pub fn with_head_timeout(mut self, head_timeout: Duration) -> Self {
        self.head_timeout = head_timeout;
        self
    }
}

/// Read until the request head is complete
///
/// Returns the head and every byte read so far, or `None` if the caller
/// closed before sending a full head.
async fn read_head<IO>(io: &mut IO) -> Result<Option<(RequestHead, Vec<u8>)>, HostError>
where
    IO: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match io.read(&mut chunk).await {
            Ok(0) | Err(_) => return Ok(None),
            Ok(n) => n,
        };
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(head) = parse_request_head(&buffer)? {
            return Ok(Some((head, buffer)));
        }
        if buffer.len() >= MAX_HEAD_SIZE {
            return Err(HostError::TooLarge);
        }
    }
}

/// Route one plain HTTP connection and relay it to its tunnel
pub async fn serve_connection<IO>(
    io: IO,
    peer_addr: SocketAddr,
    ctx: &RouteContext,
) -> Result<(), ServerError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    route(io, peer_addr, ctx, "http", None).await
}

/// Route one decrypted HTTPS connection
///
/// The `Host` header must name the hostname the TLS session was set up for;
/// anything else gets `421 Misdirected Request`.
pub async fn serve_tls_connection<IO>(
    io: IO,
    peer_addr: SocketAddr,
    ctx: &RouteContext,
    server_name: &str,
) -> Result<(), ServerError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    route(io, peer_addr, ctx, "https", Some(server_name)).await
}

async fn route<IO>(
    mut io: IO,
    peer_addr: SocketAddr,
    ctx: &RouteContext,
    scheme: &'static str,
    server_name: Option<&str>,
) -> Result<(), ServerError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    let parsed = match timeout(ctx.head_timeout, read_head(&mut io)).await {
        Ok(parsed) => parsed,
        Err(_) => {
            debug!(peer = %peer_addr, scheme, "Timed out waiting for request head");
            return Ok(());
        }
    };

    let (head, buffered) = match parsed {
        Ok(Some(parsed)) => parsed,
        Ok(None) => {
            debug!(peer = %peer_addr, scheme, "Connection closed before request head");
            return Ok(());
        }
        Err(HostError::TooLarge) => {
            debug!(peer = %peer_addr, scheme, "Request head too large");
            io.write_all(&response::request_header_too_large()).await?;
            return Ok(());
        }
        Err(e) => {
            debug!(peer = %peer_addr, scheme, "Rejecting request: {}", e);
            io.write_all(&response::bad_request()).await?;
            return Ok(());
        }
    };

    if let Some(challenges) = &ctx.challenges {
        if head.method == "GET" {
            if let Some(answer) = challenges.respond(&head.path) {
                let reply = match answer {
                    Some(key_authorization) => {
                        info!(path = %head.path, "Served ACME challenge");
                        response::challenge(&key_authorization)
                    }
                    None => response::challenge_not_found(),
                };
                io.write_all(&reply).await?;
                io.shutdown().await?;
                return Ok(());
            }
        }
    }

    let Some(host) = head.host.clone() else {
        info!(peer = %peer_addr, scheme, outcome = "route_miss", "Request without Host header");
        io.write_all(&response::not_found()).await?;
        io.shutdown().await?;
        return Ok(());
    };

    if let Some(server_name) = server_name {
        if host != server_name {
            info!(
                peer = %peer_addr,
                scheme,
                hostname = %host,
                server_name,
                outcome = "misdirected",
                "Host does not match TLS server name"
            );
            io.write_all(&response::misdirected()).await?;
            io.shutdown().await?;
            return Ok(());
        }
    }

    let Some(record) = ctx.registry.get(&host) else {
        info!(peer = %peer_addr, scheme, hostname = %host, outcome = "route_miss", "No tunnel for host");
        io.write_all(&response::not_found()).await?;
        io.shutdown().await?;
        return Ok(());
    };

    let mut channel = match ctx.forwarder.open(&record).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                peer = %peer_addr,
                scheme,
                hostname = %host,
                outcome = "upstream_unavailable",
                "Tunnel unreachable: {}",
                e
            );
            io.write_all(&response::bad_gateway()).await?;
            io.shutdown().await?;
            return Ok(());
        }
    };

    let channel_id = channel.channel_id();
    match channel.relay(&mut io, &buffered).await {
        Ok(stats) => {
            info!(
                peer = %peer_addr,
                scheme,
                hostname = %host,
                channel_id,
                method = %head.method,
                path = %head.path,
                bytes_in = stats.bytes_to_tunnel,
                bytes_out = stats.bytes_from_tunnel,
                outcome = "proxied",
                "Request proxied"
            );
        }
        Err(e) => {
            let stats = channel.stats();
            warn!(
                peer = %peer_addr,
                scheme,
                hostname = %host,
                channel_id,
                bytes_out = stats.bytes_from_tunnel,
                outcome = "upstream_unavailable",
                "Relay failed: {}",
                e
            );
            if stats.bytes_from_tunnel == 0 {
                // Caller may be gone already
                let _ = io.write_all(&response::bad_gateway()).await;
                let _ = io.shutdown().await;
            }
        }
    }

    Ok(())
}
