//! Authentication and lifecycle hooks
//!
//! The SSH server calls these to turn a login into an upstream connection
//! and to customize a running session. `DirectoryHooks` is the production
//! implementation backed by the tunnel directory.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

use super::channel::BoxedReader;
use super::connection::UpstreamConnection;
use super::upstream::UpstreamDialer;
use crate::directory::DirectoryClient;
use crate::error::{Error, Result};
use crate::protocol::{SessionIdentity, Way};

/// What is known about a downstream connection before authentication
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub peer: Option<SocketAddr>,
}

impl ConnectionMeta {
    pub fn new(peer: Option<SocketAddr>) -> Self {
        Self { peer }
    }

    pub fn peer_address(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Result of a successful login
pub struct Authenticated {
    pub identity: SessionIdentity,
    pub upstream: Arc<dyn UpstreamConnection>,
}

impl std::fmt::Debug for Authenticated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticated")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn authenticate_password(
        &self,
        meta: &ConnectionMeta,
        user: &str,
        password: &str,
    ) -> Result<Authenticated>;

    /// Called after the client proved possession of `key`
    async fn authenticate_publickey(
        &self,
        _meta: &ConnectionMeta,
        user: &str,
        _key: &russh::keys::PublicKey,
    ) -> Result<Authenticated> {
        Err(Error::UpstreamDial(format!(
            "public-key login not available for {}",
            user
        )))
    }

    /// Wrap the upstream reader of each channel before it feeds the
    /// downstream writer
    fn wrap_reader(&self, _identity: &SessionIdentity, reader: BoxedReader) -> BoxedReader {
        reader
    }

    /// Called once after a session has fully shut down
    async fn on_close(&self, _identity: &SessionIdentity) {}
}

/// Resolves logins through the directory and dials the destination
pub struct DirectoryHooks {
    directory: DirectoryClient,
    dialer: UpstreamDialer,
    way: Way,
}

impl DirectoryHooks {
    pub fn new(directory: DirectoryClient, dialer: UpstreamDialer) -> Self {
        Self {
            directory,
            dialer,
            way: Way::Terminal,
        }
    }

    pub fn with_way(mut self, way: Way) -> Self {
        self.way = way;
        self
    }
}

#[async_trait]
impl SessionHooks for DirectoryHooks {
    async fn authenticate_password(
        &self,
        meta: &ConnectionMeta,
        user: &str,
        password: &str,
    ) -> Result<Authenticated> {
        let destination = self.directory.resolve(user).await?;
        debug!(
            code = %destination.code,
            target = %destination.address(),
            user = %destination.user,
            "Resolved tunnel"
        );

        let upstream = self.dialer.dial_password(&destination, password).await?;
        info!(code = %destination.code, peer = %meta.peer_address(), "Upstream authenticated");

        Ok(Authenticated {
            identity: SessionIdentity::new(destination.code, meta.peer_address(), self.way),
            upstream: Arc::new(upstream),
        })
    }

    async fn authenticate_publickey(
        &self,
        meta: &ConnectionMeta,
        user: &str,
        _key: &russh::keys::PublicKey,
    ) -> Result<Authenticated> {
        if !self.dialer.has_identity() {
            return Err(Error::UpstreamDial(
                "public-key login requires upstream.identity_file".to_string(),
            ));
        }

        let destination = self.directory.resolve(user).await?;
        let upstream = self.dialer.dial_identity(&destination).await?;
        info!(code = %destination.code, peer = %meta.peer_address(), "Upstream authenticated with proxy identity");

        Ok(Authenticated {
            identity: SessionIdentity::new(destination.code, meta.peer_address(), self.way),
            upstream: Arc::new(upstream),
        })
    }
}
