//! Plain HTTP listener

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::proxy::{serve_connection, RouteContext};
use crate::ServerError;

pub struct HttpServer {
    listener: TcpListener,
    ctx: RouteContext,
}

impl HttpServer {
    /// Bind the listener; failure here is fatal for the relay
    pub async fn bind(addr: SocketAddr, ctx: RouteContext) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(Self { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let local_addr = self.local_addr()?;
        info!("HTTP server listening on {}", local_addr);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, peer_addr, &ctx).await {
                            debug!(peer = %peer_addr, "HTTP connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                }
            }
        }

        info!("HTTP server on {} stopped", local_addr);
        Ok(())
    }
}
