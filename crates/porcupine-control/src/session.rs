//! Authenticated client sessions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use porcupine_router::SessionHandle;
use porcupine_transport::{TransportConnection, TransportResult, TransportStream};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Object-safe view of a transport connection that can open data channels
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_channel(&self) -> TransportResult<Box<dyn TransportStream>>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
impl<C> ChannelOpener for C
where
    C: TransportConnection + 'static,
{
    async fn open_channel(&self) -> TransportResult<Box<dyn TransportStream>> {
        let stream = self.open_stream().await?;
        Ok(Box::new(stream))
    }

    fn is_closed(&self) -> bool {
        TransportConnection::is_closed(self)
    }
}

/// One authenticated client connection
pub struct Session {
    id: String,
    fingerprint: String,
    remote_addr: SocketAddr,
    created_at: DateTime<Utc>,
    opener: Arc<dyn ChannelOpener>,
    cancel: CancellationToken,
    next_channel: AtomicU64,
}

impl Session {
    pub fn new(
        fingerprint: impl Into<String>,
        remote_addr: SocketAddr,
        opener: Arc<dyn ChannelOpener>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            fingerprint: fingerprint.into(),
            remote_addr,
            created_at: Utc::now(),
            opener,
            cancel,
            next_channel: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// SHA-256 fingerprint of the authenticated public key
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Token cancelled when the session ends
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn next_channel_id(&self) -> u64 {
        self.next_channel.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn open_channel(&self) -> TransportResult<Box<dyn TransportStream>> {
        self.opener.open_channel().await
    }
}

impl SessionHandle for Session {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.opener.is_closed()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .field("remote_addr", &self.remote_addr)
            .field("created_at", &self.created_at)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
