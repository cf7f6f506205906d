//! In-memory channels, connections and audit sink
//!
//! Drives the session core without a network: each `ChannelEnd` handed to
//! the proxy has a `MemoryPeer` playing the remote side. Built for unit
//! tests and behind the `test-util` feature.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot, watch};

use super::channel::{
    ChannelAcceptor, ChannelControl, ChannelEnd, ChannelEvent, ChannelKind, ChunkReader,
    IncomingChannel,
};
use super::connection::{DownstreamConnection, RemoteCommand, UpstreamConnection};
use crate::control::{AuditSink, CallbackRegistry, CloseCallback, RegistrationId};
use crate::error::{Error, Result};
use crate::protocol::{ChannelRequest, ControlEvent, Way};

const CHANNEL_CAPACITY: usize = 64;

/// What the proxy sent to a peer
pub enum PeerMessage {
    Data(Bytes),
    ExtendedData { code: u32, data: Bytes },
    /// `reply` is set when the proxy waits for an answer
    Request {
        request: ChannelRequest,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// Answer to a request the peer sent
    Reply(bool),
    Eof,
    Close,
}

impl std::fmt::Debug for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::Data(data) => f.debug_tuple("Data").field(data).finish(),
            PeerMessage::ExtendedData { code, data } => f
                .debug_struct("ExtendedData")
                .field("code", code)
                .field("data", data)
                .finish(),
            PeerMessage::Request { request, reply } => f
                .debug_struct("Request")
                .field("request", request)
                .field("want_reply", &reply.is_some())
                .finish(),
            PeerMessage::Reply(accepted) => f.debug_tuple("Reply").field(accepted).finish(),
            PeerMessage::Eof => f.write_str("Eof"),
            PeerMessage::Close => f.write_str("Close"),
        }
    }
}

impl PartialEq for PeerMessage {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PeerMessage::Data(a), PeerMessage::Data(b)) => a == b,
            (
                PeerMessage::ExtendedData { code: c1, data: d1 },
                PeerMessage::ExtendedData { code: c2, data: d2 },
            ) => c1 == c2 && d1 == d2,
            (PeerMessage::Request { request: a, .. }, PeerMessage::Request { request: b, .. }) => {
                a == b
            }
            (PeerMessage::Reply(a), PeerMessage::Reply(b)) => a == b,
            (PeerMessage::Eof, PeerMessage::Eof) | (PeerMessage::Close, PeerMessage::Close) => true,
            _ => false,
        }
    }
}

struct MemoryControl {
    tx: mpsc::UnboundedSender<PeerMessage>,
    closed: watch::Sender<bool>,
}

impl MemoryControl {
    fn send(&self, message: PeerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::Protocol("Peer is gone".to_string()))
    }
}

#[async_trait]
impl ChannelControl for MemoryControl {
    async fn send_request(&self, request: &ChannelRequest) -> Result<bool> {
        if !request.want_reply {
            self.send(PeerMessage::Request {
                request: request.clone(),
                reply: None,
            })?;
            return Ok(true);
        }

        let (reply, answer) = oneshot::channel();
        self.send(PeerMessage::Request {
            request: request.clone(),
            reply: Some(reply),
        })?;
        Ok(answer.await.unwrap_or(false))
    }

    async fn reply(&self, accepted: bool) -> Result<()> {
        self.send(PeerMessage::Reply(accepted))
    }

    async fn write_extended(&self, code: u32, data: &[u8]) -> Result<()> {
        self.send(PeerMessage::ExtendedData {
            code,
            data: Bytes::copy_from_slice(data),
        })
    }

    async fn eof(&self) -> Result<()> {
        self.send(PeerMessage::Eof)
    }

    async fn close(&self) {
        if !self.closed.send_replace(true) {
            let _ = self.tx.send(PeerMessage::Close);
        }
    }
}

/// Writer half delivering each write as one `PeerMessage::Data`
struct MemoryWriter {
    tx: mpsc::UnboundedSender<PeerMessage>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.tx.send(PeerMessage::Data(Bytes::copy_from_slice(buf))) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// The remote side of an in-memory channel
pub struct MemoryPeer {
    data: Option<mpsc::Sender<Bytes>>,
    events: Option<mpsc::Sender<ChannelEvent>>,
    rx: mpsc::UnboundedReceiver<PeerMessage>,
    backlog: VecDeque<PeerMessage>,
}

impl MemoryPeer {
    /// Send channel data; false once the proxy side is gone
    pub async fn send_data(&self, data: &[u8]) -> bool {
        match &self.data {
            Some(tx) => tx.send(Bytes::copy_from_slice(data)).await.is_ok(),
            None => false,
        }
    }

    pub fn send_eof(&mut self) {
        self.data = None;
    }

    /// Queue a request without waiting for the answer
    pub async fn send_request(&self, request: ChannelRequest) -> bool {
        self.send_event(ChannelEvent::Request(request)).await
    }

    /// Send a request and wait for the proxy's answer
    ///
    /// Messages received before the answer stay queued for `recv`.
    pub async fn request(&mut self, request: ChannelRequest) -> Option<bool> {
        if !self.send_request(request).await {
            return None;
        }
        loop {
            match self.rx.recv().await? {
                PeerMessage::Reply(accepted) => return Some(accepted),
                other => self.backlog.push_back(other),
            }
        }
    }

    pub async fn send_extended(&self, code: u32, data: &[u8]) -> bool {
        self.send_event(ChannelEvent::ExtendedData {
            code,
            data: Bytes::copy_from_slice(data),
        })
        .await
    }

    async fn send_event(&self, event: ChannelEvent) -> bool {
        match &self.events {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Close the channel from the peer side
    pub fn close(&mut self) {
        self.data = None;
        self.events = None;
    }

    pub async fn recv(&mut self) -> Option<PeerMessage> {
        match self.backlog.pop_front() {
            Some(message) => Some(message),
            None => self.rx.recv().await,
        }
    }

    /// Collect data until EOF or close, answering requests with `accept`
    pub async fn read_until_eof(&mut self, accept: bool) -> (Vec<u8>, Vec<ChannelRequest>) {
        self.collect(accept, true).await
    }

    /// Collect data until close, answering requests with `accept`
    pub async fn read_until_close(&mut self, accept: bool) -> (Vec<u8>, Vec<ChannelRequest>) {
        self.collect(accept, false).await
    }

    async fn collect(&mut self, accept: bool, stop_at_eof: bool) -> (Vec<u8>, Vec<ChannelRequest>) {
        let mut data = Vec::new();
        let mut requests = Vec::new();
        while let Some(message) = self.recv().await {
            match message {
                PeerMessage::Data(chunk) => data.extend_from_slice(&chunk),
                PeerMessage::Request { request, reply } => {
                    if let Some(reply) = reply {
                        let _ = reply.send(accept);
                    }
                    requests.push(request);
                }
                PeerMessage::Eof if stop_at_eof => break,
                PeerMessage::Close => break,
                PeerMessage::Eof | PeerMessage::Reply(_) | PeerMessage::ExtendedData { .. } => {}
            }
        }
        (data, requests)
    }
}

/// Create a channel end and the peer driving it
///
/// Closing the end's control stops delivery of the peer's data and events.
pub fn pair() -> (ChannelEnd, MemoryPeer) {
    build(None)
}

/// Like [`pair`], but the channel end also sees a close once `shutdown` is set
pub fn pair_with_shutdown(shutdown: watch::Receiver<bool>) -> (ChannelEnd, MemoryPeer) {
    build(Some(shutdown))
}

fn build(shutdown: Option<watch::Receiver<bool>>) -> (ChannelEnd, MemoryPeer) {
    let (peer_data_tx, peer_data_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (peer_events_tx, peer_events_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (end_data_tx, end_data_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (end_events_tx, end_events_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (closed, closed_rx) = watch::channel(false);

    tokio::spawn(
        Forwarder {
            closed: closed_rx,
            shutdown,
            data_in: peer_data_rx,
            data_out: Some(end_data_tx),
            events_in: peer_events_rx,
            events_out: Some(end_events_tx),
        }
        .run(),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let end = ChannelEnd {
        reader: Box::pin(ChunkReader::new(end_data_rx)),
        writer: Box::pin(MemoryWriter { tx: tx.clone() }),
        control: Arc::new(MemoryControl { tx, closed }),
        events: end_events_rx,
    };
    let peer = MemoryPeer {
        data: Some(peer_data_tx),
        events: Some(peer_events_tx),
        rx,
        backlog: VecDeque::new(),
    };
    (end, peer)
}

/// Moves peer traffic to the channel end until either side closes
///
/// Events are preferred over data so a request sent before EOF is
/// delivered before the reader sees EOF.
struct Forwarder {
    closed: watch::Receiver<bool>,
    shutdown: Option<watch::Receiver<bool>>,
    data_in: mpsc::Receiver<Bytes>,
    data_out: Option<mpsc::Sender<Bytes>>,
    events_in: mpsc::Receiver<ChannelEvent>,
    events_out: Option<mpsc::Sender<ChannelEvent>>,
}

impl Forwarder {
    async fn run(mut self) {
        while self.data_out.is_some() || self.events_out.is_some() {
            tokio::select! {
                biased;
                _ = async { let _ = self.closed.wait_for(|closed| *closed).await; } => return,
                _ = wait_shutdown(&mut self.shutdown) => return,
                event = self.events_in.recv(), if self.events_out.is_some() => {
                    match (event, &self.events_out) {
                        (Some(event), Some(tx)) if tx.send(event.clone()).await.is_ok() => {}
                        _ => self.events_out = None,
                    }
                }
                chunk = self.data_in.recv(), if self.data_out.is_some() => {
                    match (chunk, &self.data_out) {
                        (Some(chunk), Some(tx)) if tx.send(chunk.clone()).await.is_ok() => {}
                        _ => self.data_out = None,
                    }
                }
            }
        }
    }
}

async fn wait_shutdown(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.wait_for(|closed| *closed).await;
        }
        None => std::future::pending().await,
    }
}

/// Acceptor reporting its decision on a oneshot
struct MemoryAcceptor {
    end: ChannelEnd,
    decision: oneshot::Sender<bool>,
}

#[async_trait]
impl ChannelAcceptor for MemoryAcceptor {
    async fn accept(self: Box<Self>) -> Result<ChannelEnd> {
        let _ = self.decision.send(true);
        Ok(self.end)
    }

    fn reject(self: Box<Self>) {
        let _ = self.decision.send(false);
    }
}

/// A downstream channel open, its peer, and where the decision lands
pub fn incoming(kind: ChannelKind) -> (IncomingChannel, MemoryPeer, oneshot::Receiver<bool>) {
    let (end, peer) = pair();
    let (decision, decided) = oneshot::channel();
    let incoming = IncomingChannel {
        kind,
        acceptor: Box::new(MemoryAcceptor { end, decision }),
    };
    (incoming, peer, decided)
}

/// Upstream connection whose channels are handed to the test as peers
pub struct MemoryUpstream {
    shutdown: watch::Sender<bool>,
    opened: mpsc::UnboundedSender<(ChannelKind, MemoryPeer)>,
    commands: Mutex<Vec<String>>,
    refuse_opens: AtomicBool,
}

impl MemoryUpstream {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ChannelKind, MemoryPeer)>) {
        let (opened, rx) = mpsc::unbounded_channel();
        let upstream = Arc::new(Self {
            shutdown: watch::channel(false).0,
            opened,
            commands: Mutex::new(Vec::new()),
            refuse_opens: AtomicBool::new(false),
        });
        (upstream, rx)
    }

    /// Make every following channel open fail
    pub fn refuse_opens(&self) {
        self.refuse_opens.store(true, Ordering::SeqCst);
    }

    /// Commands started so far
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl UpstreamConnection for MemoryUpstream {
    async fn open_channel(&self, kind: &ChannelKind) -> Result<ChannelEnd> {
        if self.is_closed() || self.refuse_opens.load(Ordering::SeqCst) {
            return Err(Error::ChannelOpen(format!("{} refused", kind)));
        }
        let (end, peer) = pair_with_shutdown(self.shutdown.subscribe());
        self.opened
            .send((kind.clone(), peer))
            .map_err(|_| Error::ChannelOpen("nobody is watching opens".to_string()))?;
        Ok(end)
    }

    async fn start_command(&self, command: &str) -> Result<Box<dyn RemoteCommand>> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
        Ok(Box::new(MemoryCommand))
    }

    async fn close(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn wait_closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

struct MemoryCommand;

#[async_trait]
impl RemoteCommand for MemoryCommand {
    async fn wait(&mut self) -> Option<u32> {
        Some(0)
    }

    async fn close(&mut self) {}
}

/// Downstream connection counting its closes
#[derive(Debug, Default)]
pub struct MemoryDownstream {
    closes: AtomicUsize,
}

impl MemoryDownstream {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownstreamConnection for MemoryDownstream {
    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Audit sink recording events and holding close callbacks
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ControlEvent>>,
    registry: CallbackRegistry,
}

impl MemorySink {
    pub fn events(&self) -> Vec<ControlEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Event type names in emission order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(ControlEvent::kind).collect()
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn emit(&self, event: ControlEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn register_close(
        &self,
        code: &str,
        way: Way,
        callback: CloseCallback,
    ) -> Option<RegistrationId> {
        Some(self.registry.register(code, way, callback))
    }

    fn deregister_close(&self, code: &str, way: Way, id: RegistrationId) {
        self.registry.remove(code, way, id);
    }
}
