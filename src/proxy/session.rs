//! Proxy session core
//!
//! A `ProxySession` owns one authenticated downstream connection and its
//! upstream connection. It pairs every downstream channel with a freshly
//! opened upstream channel and relays each pair until the session ends.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::channel::{ChannelEnd, IncomingChannel};
use super::connection::{DownstreamConnection, UpstreamConnection};
use super::hooks::SessionHooks;
use super::relay::{ChannelRelay, DEFAULT_BUFFER_SIZE};
use crate::control::{AuditSink, NullSink};
use crate::error::{Error, Result};
use crate::protocol::{ControlEvent, SessionIdentity};

pub struct ProxySession {
    identity: Arc<SessionIdentity>,
    upstream: Arc<dyn UpstreamConnection>,
    downstream: Arc<dyn DownstreamConnection>,
    incoming: mpsc::Receiver<IncomingChannel>,
    sink: Arc<dyn AuditSink>,
    hooks: Option<Arc<dyn SessionHooks>>,
    buffer_size: usize,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ProxySession {
    /// `incoming` yields the channels the downstream client opens and ends
    /// when the downstream connection is gone
    pub fn new(
        identity: SessionIdentity,
        upstream: Arc<dyn UpstreamConnection>,
        downstream: Arc<dyn DownstreamConnection>,
        incoming: mpsc::Receiver<IncomingChannel>,
    ) -> Self {
        Self {
            identity: Arc::new(identity),
            upstream,
            downstream,
            incoming,
            sink: Arc::new(NullSink),
            hooks: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            shutdown: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// End the session once `shutdown` turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Relay until either connection ends, a close command arrives or the
    /// proxy shuts down
    ///
    /// Emits exactly one connect event before relaying and exactly one
    /// disconnect event after every channel has finished, on every path.
    pub async fn run(mut self) -> Result<()> {
        let identity = Arc::clone(&self.identity);
        info!(
            code = %identity.code,
            peer = %identity.peer_address,
            way = %identity.kind,
            "Session started"
        );
        self.sink.emit(ControlEvent::open_connect(&identity)).await;

        let kill = Arc::new(Notify::new());
        let registration = {
            let kill = Arc::clone(&kill);
            self.sink.register_close(
                &identity.code,
                identity.kind,
                Box::new(move || kill.notify_one()),
            )
        };

        let relay = ChannelRelay::new(
            Arc::clone(&identity),
            Arc::clone(&self.sink),
            Arc::clone(&self.upstream),
        )
        .with_hooks(self.hooks.clone())
        .with_buffer_size(self.buffer_size);

        let mut relays = JoinSet::new();
        let result = self.serve(&kill, &relay, &mut relays).await;
        if let Err(e) = &result {
            warn!(code = %identity.code, error = %e, "Session failed");
        }

        // Closing upstream ends every relay; they then close their
        // downstream channels
        self.upstream.close().await;
        while let Some(joined) = relays.join_next().await {
            log_relay_exit(&identity, joined);
        }

        self.sink.emit(ControlEvent::close_connect(&identity)).await;
        if let Some(id) = registration {
            self.sink.deregister_close(&identity.code, identity.kind, id);
        }
        self.downstream.close().await;
        if let Some(hooks) = &self.hooks {
            hooks.on_close(&identity).await;
        }

        info!(code = %identity.code, peer = %identity.peer_address, "Session closed");
        result
    }

    async fn serve(
        &mut self,
        kill: &Notify,
        relay: &ChannelRelay,
        relays: &mut JoinSet<()>,
    ) -> Result<()> {
        let upstream = Arc::clone(&self.upstream);
        let mut shutdown = self.shutdown.take();
        loop {
            tokio::select! {
                _ = kill.notified() => {
                    info!(code = %self.identity.code, "Close command received");
                    return Ok(());
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!(code = %self.identity.code, "Proxy shutting down, ending session");
                    return Ok(());
                }
                _ = upstream.wait_closed() => {
                    debug!(code = %self.identity.code, "Upstream connection ended");
                    return Ok(());
                }
                incoming = self.incoming.recv() => {
                    let Some(incoming) = incoming else {
                        debug!(code = %self.identity.code, "Downstream connection ended");
                        return Ok(());
                    };
                    let (down, up) = tokio::select! {
                        _ = kill.notified() => {
                            info!(code = %self.identity.code, "Close command received");
                            return Ok(());
                        }
                        _ = shutdown_requested(&mut shutdown) => {
                            info!(code = %self.identity.code, "Proxy shutting down, ending session");
                            return Ok(());
                        }
                        pair = self.open_pair(incoming) => pair?,
                    };
                    relays.spawn(relay.clone().run(down, up));
                }
                Some(joined) = relays.join_next(), if !relays.is_empty() => {
                    log_relay_exit(&self.identity, joined);
                }
            }
        }
    }

    /// Open the matching upstream channel, then accept the downstream one
    async fn open_pair(&self, incoming: IncomingChannel) -> Result<(ChannelEnd, ChannelEnd)> {
        let IncomingChannel { kind, acceptor } = incoming;
        debug!(code = %self.identity.code, channel = %kind, "Opening channel pair");

        let up = match self.upstream.open_channel(&kind).await {
            Ok(up) => up,
            Err(e) => {
                acceptor.reject();
                return Err(Error::ChannelOpen(format!("upstream {}: {}", kind, e)));
            }
        };

        match acceptor.accept().await {
            Ok(down) => Ok((down, up)),
            Err(e) => {
                up.control.close().await;
                Err(Error::ChannelOpen(format!("downstream {}: {}", kind, e)))
            }
        }
    }
}

/// Resolves once the shutdown flag is set; never without a receiver
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

/// Shutdown signal and liveness tracking for the sessions of one listener
#[derive(Clone)]
pub struct SessionTracker {
    shutdown: watch::Receiver<bool>,
    alive: mpsc::WeakSender<()>,
}

/// Waits for every session spawned through the matching `SessionTracker`
pub struct SessionDrain {
    alive: mpsc::Sender<()>,
    done: mpsc::Receiver<()>,
}

impl SessionTracker {
    pub fn new(shutdown: watch::Receiver<bool>) -> (Self, SessionDrain) {
        let (alive, done) = mpsc::channel(1);
        let tracker = Self {
            shutdown,
            alive: alive.downgrade(),
        };
        (tracker, SessionDrain { alive, done })
    }

    /// Run a session in the background until it ends or shutdown is signalled
    pub fn spawn(&self, session: ProxySession) {
        // no longer tracked once draining began; shutdown is already set then
        let alive = self.alive.upgrade();
        let session = session.with_shutdown(self.shutdown.clone());
        tokio::spawn(async move {
            let _alive = alive;
            let code = session.identity().code.clone();
            if let Err(e) = session.run().await {
                debug!(code = %code, error = %e, "Session ended with error");
            }
        });
    }
}

impl SessionDrain {
    /// Wait until every tracked session has finished
    ///
    /// Returns false if sessions were still running after `timeout`.
    pub async fn wait(self, timeout: Duration) -> bool {
        let Self { alive, mut done } = self;
        drop(alive);
        tokio::time::timeout(timeout, done.recv()).await.is_ok()
    }
}

fn log_relay_exit(identity: &SessionIdentity, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!(code = %identity.code, "Channel relay panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InboundCommand, Way};
    use crate::proxy::channel::ChannelKind;
    use crate::proxy::memory::{self, MemoryDownstream, MemorySink, MemoryUpstream};
    use std::time::Duration;

    struct Fixture {
        sink: Arc<MemorySink>,
        upstream: Arc<MemoryUpstream>,
        downstream: Arc<MemoryDownstream>,
        opens: mpsc::Sender<IncomingChannel>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    type Opened = mpsc::UnboundedReceiver<(ChannelKind, memory::MemoryPeer)>;

    fn start() -> (Fixture, Opened) {
        start_with(Arc::new(MemorySink::default()), None)
    }

    fn build(sink: Arc<MemorySink>) -> (ProxySession, Fixture, Opened) {
        let (upstream, opened) = MemoryUpstream::new();
        let downstream = Arc::new(MemoryDownstream::default());
        let (opens, incoming) = mpsc::channel(4);
        let session = ProxySession::new(
            SessionIdentity::new("abc123", "127.0.0.1:40000", Way::Terminal),
            upstream.clone(),
            downstream.clone(),
            incoming,
        )
        .with_sink(sink.clone());
        let fixture = Fixture {
            sink,
            upstream,
            downstream,
            opens,
            task: tokio::spawn(async { Ok(()) }),
        };
        (session, fixture, opened)
    }

    fn start_with(
        sink: Arc<MemorySink>,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> (Fixture, Opened) {
        let (mut session, mut fixture, opened) = build(sink);
        if let Some(shutdown) = shutdown {
            session = session.with_shutdown(shutdown);
        }
        fixture.task = tokio::spawn(session.run());
        (fixture, opened)
    }

    async fn open_one(fx: &Fixture, opened: &mut Opened) -> (memory::MemoryPeer, memory::MemoryPeer) {
        let (incoming, client, decided) = memory::incoming(ChannelKind::Session);
        fx.opens.send(incoming).await.unwrap();
        assert!(decided.await.unwrap());
        let (_, server) = opened.recv().await.unwrap();
        (client, server)
    }

    async fn finish(task: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("session did not end")
            .expect("session panicked")
    }

    #[tokio::test]
    async fn test_one_connect_and_disconnect_for_many_channels() {
        let (fx, mut opened) = start();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (incoming, client, decided) = memory::incoming(ChannelKind::Session);
            fx.opens.send(incoming).await.unwrap();
            assert!(decided.await.unwrap());
            let (kind, server) = opened.recv().await.unwrap();
            assert_eq!(kind, ChannelKind::Session);
            clients.push((client, server));
        }

        for (client, _) in clients.iter_mut() {
            client.close();
        }
        drop(fx.opens);
        finish(fx.task).await.unwrap();

        assert_eq!(fx.sink.kinds(), vec!["open_connect", "close_connect"]);
        assert_eq!(fx.downstream.close_count(), 1);
        assert!(fx.upstream.is_closed());
        assert!(fx.sink.registry().is_empty());
    }

    #[tokio::test]
    async fn test_close_command_ends_idle_session() {
        let (fx, mut opened) = start();

        let (incoming, _client, decided) = memory::incoming(ChannelKind::Session);
        fx.opens.send(incoming).await.unwrap();
        assert!(decided.await.unwrap());
        let (_, _server) = opened.recv().await.unwrap();
        assert_eq!(fx.sink.registry().len(), 1);

        let fired = fx
            .sink
            .registry()
            .dispatch(&InboundCommand::close("abc123", Some(Way::Terminal)));
        assert_eq!(fired, 1);

        finish(fx.task).await.unwrap();
        assert!(fx.upstream.is_closed());
        assert_eq!(fx.sink.kinds(), vec!["open_connect", "close_connect"]);
    }

    #[tokio::test]
    async fn test_upstream_open_failure_rejects_channel() {
        let (fx, _opened) = start();
        fx.upstream.refuse_opens();

        let (incoming, _client, decided) = memory::incoming(ChannelKind::Session);
        fx.opens.send(incoming).await.unwrap();
        assert!(!decided.await.unwrap());

        let err = finish(fx.task).await.unwrap_err();
        assert!(matches!(err, Error::ChannelOpen(_)));
        assert_eq!(fx.sink.kinds(), vec!["open_connect", "close_connect"]);
        assert_eq!(fx.downstream.close_count(), 1);
    }

    #[tokio::test]
    async fn test_upstream_loss_ends_session() {
        let (fx, _opened) = start();
        fx.upstream.close().await;

        finish(fx.task).await.unwrap();
        assert_eq!(fx.sink.kinds(), vec!["open_connect", "close_connect"]);
        drop(fx.opens);
    }

    #[tokio::test]
    async fn test_overlapping_sessions_stay_killable_after_one_ends() {
        let sink = Arc::new(MemorySink::default());
        let (first, mut first_opened) = start_with(sink.clone(), None);
        let (second, mut second_opened) = start_with(sink.clone(), None);
        let (_a, _b) = open_one(&first, &mut first_opened).await;
        let (_c, _d) = open_one(&second, &mut second_opened).await;
        assert_eq!(sink.registry().len(), 2);

        // same code and way: the first login disconnects on its own
        first.upstream.close().await;
        finish(first.task).await.unwrap();
        assert_eq!(sink.registry().len(), 1);

        let fired = sink
            .registry()
            .dispatch(&InboundCommand::close("abc123", Some(Way::Terminal)));
        assert_eq!(fired, 1);
        finish(second.task).await.unwrap();
        assert!(second.upstream.is_closed());
        assert!(sink.registry().is_empty());
        assert_eq!(
            sink.kinds(),
            vec!["open_connect", "open_connect", "close_connect", "close_connect"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_ends_active_session_with_one_disconnect() {
        let (stop, shutdown) = watch::channel(false);
        let (fx, mut opened) = start_with(Arc::new(MemorySink::default()), Some(shutdown));
        let (_client, _server) = open_one(&fx, &mut opened).await;

        stop.send(true).unwrap();
        finish(fx.task).await.unwrap();

        assert_eq!(fx.sink.kinds(), vec!["open_connect", "close_connect"]);
        assert_eq!(fx.downstream.close_count(), 1);
        assert!(fx.upstream.is_closed());
        assert!(fx.sink.registry().is_empty());
    }

    #[tokio::test]
    async fn test_tracker_drains_sessions_on_shutdown() {
        let (stop, shutdown) = watch::channel(false);
        let (tracker, drain) = SessionTracker::new(shutdown);

        let sink = Arc::new(MemorySink::default());
        let (session, fx, mut opened) = build(sink.clone());
        tracker.spawn(session);
        let (_client, _server) = open_one(&fx, &mut opened).await;
        assert_eq!(sink.kinds(), vec!["open_connect"]);

        stop.send(true).unwrap();
        assert!(drain.wait(Duration::from_secs(10)).await);
        assert_eq!(sink.kinds(), vec!["open_connect", "close_connect"]);
        assert!(fx.upstream.is_closed());
    }

    #[tokio::test]
    async fn test_drain_without_sessions_returns_at_once() {
        let (_stop, shutdown) = watch::channel(false);
        let (_tracker, drain) = SessionTracker::new(shutdown);
        // tracker clones hold only weak handles
        assert!(drain.wait(Duration::from_millis(100)).await);
    }
}
