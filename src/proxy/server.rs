//! TCP listener running the SSH server side of the proxy
//!
//! Accepts connections and runs the russh server handshake on each with a
//! fresh `ProxyHandler`. A failing connection never stops the listener.

use russh::keys::PrivateKey;
use russh::server;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::handler::ProxyHandler;
use super::hooks::{ConnectionMeta, SessionHooks};
use super::relay::DEFAULT_BUFFER_SIZE;
use super::session::SessionTracker;
use crate::control::AuditSink;
use crate::error::{Error, Result};

/// How long shutdown waits for live sessions to report their disconnect
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Load the server host key (OpenSSH or PEM, unencrypted)
pub fn load_host_key(path: &Path) -> Result<PrivateKey> {
    russh::keys::load_secret_key(path, None).map_err(|e| {
        Error::Config(format!("Failed to load host key {}: {}", path.display(), e))
    })
}

/// russh server settings for the proxy
pub fn server_config(
    host_key: PrivateKey,
    auth_rejection_time: Duration,
    inactivity_timeout: Option<Duration>,
) -> server::Config {
    server::Config {
        keys: vec![host_key],
        auth_rejection_time,
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout,
        ..Default::default()
    }
}

pub struct ProxyServer {
    listen: String,
    config: Arc<server::Config>,
    hooks: Arc<dyn SessionHooks>,
    sink: Arc<dyn AuditSink>,
    buffer_size: usize,
    /// The listener (created on bind)
    listener: Option<TcpListener>,
}

impl ProxyServer {
    pub fn new(
        listen: impl Into<String>,
        config: server::Config,
        hooks: Arc<dyn SessionHooks>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            listen: listen.into(),
            config: Arc::new(config),
            hooks,
            sink,
            buffer_size: DEFAULT_BUFFER_SIZE,
            listener: None,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Bind the listening address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.listen).await.map_err(|e| {
            Error::Listen(format!("Failed to bind to {}: {}", self.listen, e))
        })?;
        let addr = listener.local_addr()?;

        info!(address = %addr, "Proxy listening");
        self.listener = Some(listener);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Accept connections until the shutdown signal is received
    ///
    /// On shutdown every live session is ended and awaited, so each one
    /// still reports its disconnect.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Listen("Server is not bound".to_string()))?;
        let (sessions, drain) = SessionTracker::new(shutdown_rx.clone());

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Received shutdown signal, stopping listener");
                        break;
                    }
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            trace!(peer = %peer, "Accepted connection");
                            let handler = ProxyHandler::new(
                                Arc::clone(&self.hooks),
                                Arc::clone(&self.sink),
                                ConnectionMeta::new(Some(peer)),
                                self.buffer_size,
                                sessions.clone(),
                            );
                            tokio::spawn(serve_connection(Arc::clone(&self.config), stream, peer, handler));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        if drain.wait(SHUTDOWN_GRACE).await {
            info!("All sessions closed");
        } else {
            warn!(grace = ?SHUTDOWN_GRACE, "Sessions still open after shutdown grace period");
        }
        Ok(())
    }
}

async fn serve_connection(
    config: Arc<server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: ProxyHandler,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    match server::run_stream(config, stream, handler).await {
        Ok(running) => {
            if let Err(e) = running.await {
                debug!(peer = %peer, error = %e, "Connection ended with error");
            }
        }
        // Handshake failures drop the connection without side effects
        Err(e) => debug!(peer = %peer, error = %e, "SSH handshake failed"),
    }
    trace!(peer = %peer, "Connection closed");
}
