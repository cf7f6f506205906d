//! russh server handler for one downstream connection
//!
//! Holds the per-connection state between authentication and the session:
//! the login result lives here rather than in a process-wide map keyed by
//! remote address.

use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::channel::{ChannelKind, IncomingChannel};
use super::downstream::{SshChannelAcceptor, SshDownstream};
use super::hooks::{Authenticated, ConnectionMeta, SessionHooks};
use super::session::{ProxySession, SessionTracker};
use crate::control::AuditSink;
use crate::error::{Error, Result};

/// Channel opens queued between the handler and its session
const INCOMING_CAPACITY: usize = 8;

pub struct ProxyHandler {
    hooks: Arc<dyn SessionHooks>,
    sink: Arc<dyn AuditSink>,
    meta: ConnectionMeta,
    buffer_size: usize,
    sessions: SessionTracker,
    authenticated: Option<Authenticated>,
    incoming: Option<mpsc::Sender<IncomingChannel>>,
}

impl ProxyHandler {
    pub fn new(
        hooks: Arc<dyn SessionHooks>,
        sink: Arc<dyn AuditSink>,
        meta: ConnectionMeta,
        buffer_size: usize,
        sessions: SessionTracker,
    ) -> Self {
        Self {
            hooks,
            sink,
            meta,
            buffer_size,
            sessions,
            authenticated: None,
            incoming: None,
        }
    }

    fn rejected(&self, user: &str, error: &Error) -> Auth {
        if error.is_lookup() {
            info!(user = %user, peer = %self.meta.peer_address(), error = %error, "Login rejected");
        } else {
            warn!(user = %user, peer = %self.meta.peer_address(), error = %error, "Upstream login failed");
        }
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    /// Hand a channel open to the session and wait for its decision
    async fn offer(&self, kind: ChannelKind, channel: Channel<Msg>, session: &mut Session) -> bool {
        let Some(incoming) = &self.incoming else {
            debug!(channel = %kind, "Channel open before authentication");
            return false;
        };

        let (decision, decided) = oneshot::channel();
        let offer = IncomingChannel {
            kind,
            acceptor: Box::new(SshChannelAcceptor::new(channel, session.handle(), decision)),
        };
        if incoming.send(offer).await.is_err() {
            return false;
        }
        decided.await.unwrap_or(false)
    }
}

impl server::Handler for ProxyHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        match self
            .hooks
            .authenticate_password(&self.meta, user, password)
            .await
        {
            Ok(authenticated) => {
                self.authenticated = Some(authenticated);
                Ok(Auth::Accept)
            }
            Err(e) => Ok(self.rejected(user, &e)),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth> {
        match self
            .hooks
            .authenticate_publickey(&self.meta, user, public_key)
            .await
        {
            Ok(authenticated) => {
                self.authenticated = Some(authenticated);
                Ok(Auth::Accept)
            }
            Err(e) => Ok(self.rejected(user, &e)),
        }
    }

    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<()> {
        let Authenticated { identity, upstream } = self
            .authenticated
            .take()
            .ok_or_else(|| Error::Protocol("authenticated without a login result".to_string()))?;

        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        self.incoming = Some(tx);

        let proxy = ProxySession::new(
            identity,
            upstream,
            Arc::new(SshDownstream::new(session.handle())),
            rx,
        )
        .with_sink(Arc::clone(&self.sink))
        .with_hooks(Arc::clone(&self.hooks))
        .with_buffer_size(self.buffer_size);

        self.sessions.spawn(proxy);
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool> {
        Ok(self.offer(ChannelKind::Session, channel, session).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool> {
        let kind = ChannelKind::DirectTcpip {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator: originator_address.to_string(),
            originator_port,
        };
        Ok(self.offer(kind, channel, session).await)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!(address = %address, port = *port, "Refusing remote port forwarding");
        Ok(false)
    }
}
