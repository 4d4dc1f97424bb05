//! HTTP server listener
//!
//! Binds the listen socket eagerly (so bind failures surface before the
//! pipeline is considered up), then accepts connections and spawns one task
//! per connection. Optional connection cap via semaphore; graceful shutdown
//! through `run_until`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::Semaphore;

use crate::error::{BindError, Result};
use crate::server::config::ServerConfig;
use crate::server::connection::{ClientSocket, Connection};
use crate::server::context::ServerContext;

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(ClientSocket, SocketAddr)> {
        match self {
            Listener::Tcp(listener) => {
                let (socket, peer) = listener.accept().await?;
                Ok((ClientSocket::Tcp(socket), peer))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (socket, _) = listener.accept().await?;
                // Unix peers have no TCP address; report the unspecified one
                let peer = SocketAddr::from(([0, 0, 0, 0], 0));
                Ok((ClientSocket::Unix(socket), peer))
            }
        }
    }
}

/// The HTTP streaming server
pub struct StreamServer {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    listener: Listener,
    next_session_id: AtomicU64,
    client_semaphore: Option<Arc<Semaphore>>,
}

impl StreamServer {
    /// Bind the listen socket
    pub async fn bind(config: ServerConfig, ctx: Arc<ServerContext>) -> Result<Self> {
        let listener = Self::bind_listener(&config).await?;
        let client_semaphore = if config.max_clients > 0 {
            Some(Arc::new(Semaphore::new(config.max_clients)))
        } else {
            None
        };
        Ok(Self {
            config,
            ctx,
            listener,
            next_session_id: AtomicU64::new(1),
            client_semaphore,
        })
    }

    async fn bind_listener(config: &ServerConfig) -> Result<Listener> {
        #[cfg(unix)]
        if let Some(path) = &config.unix_path {
            // A stale socket file from a previous run would fail the bind
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path).map_err(|source| BindError::Unix {
                path: path.display().to_string(),
                source,
            })?;
            tracing::info!(path = %path.display(), "listening on unix socket");
            return Ok(Listener::Unix(listener));
        }

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| BindError::Tcp {
                addr: config.bind_addr,
                source,
            })?;
        tracing::info!(addr = %config.bind_addr, "http server listening");
        Ok(Listener::Tcp(listener))
    }

    /// Actual bound TCP address (differs from the config for port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(_) => None,
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown signal received");
                Ok(())
            }
            result = self.accept_loop() => result,
        }
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: ClientSocket, peer_addr: SocketAddr) {
        let permit = if let Some(sem) = &self.client_semaphore {
            match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "connection rejected: client limit reached");
                    return;
                }
            }
        } else {
            None
        };

        if let ClientSocket::Tcp(tcp) = &socket {
            if self.config.tcp_nodelay {
                let _ = tcp.set_nodelay(true);
            }
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let config = self.config.clone();
        let ctx = Arc::clone(&self.ctx);

        tokio::spawn(async move {
            let _permit = permit;
            let connection = Connection::new(session_id, socket, peer_addr, config, ctx);
            if let Err(e) = connection.run().await {
                tracing::debug!(session_id, error = %e, "connection error");
            }
        });
    }
}
