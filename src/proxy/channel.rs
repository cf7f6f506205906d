//! Library-neutral view of one SSH channel
//!
//! The relay works on `ChannelEnd`s: a byte reader, a byte writer, a control
//! handle for out-of-band traffic and a stream of incoming requests. The
//! russh adapters in `downstream` and `upstream` produce them, and so does
//! the in-memory implementation in `memory`.

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::ChannelRequest;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Out-of-band traffic received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Request(ChannelRequest),
    /// Extended data such as stderr (code 1)
    ExtendedData { code: u32, data: Bytes },
}

/// Sending side of a channel's out-of-band traffic
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Send a request to the peer
    ///
    /// When `want_reply` is set this waits for the peer's answer and returns
    /// it; otherwise it returns `true` once the request is queued.
    async fn send_request(&self, request: &ChannelRequest) -> Result<bool>;

    /// Answer the oldest request received from the peer that wanted a reply
    async fn reply(&self, accepted: bool) -> Result<()>;

    async fn write_extended(&self, code: u32, data: &[u8]) -> Result<()>;

    /// Signal that no more data will be written
    async fn eof(&self) -> Result<()>;

    /// Close the channel; repeated calls are no-ops
    async fn close(&self);
}

/// One side of a relayed channel
pub struct ChannelEnd {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub control: Arc<dyn ChannelControl>,
    /// Ends when the channel is closed
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl std::fmt::Debug for ChannelEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEnd").finish_non_exhaustive()
    }
}

/// Channel type and the type-specific open payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Session,
    DirectTcpip {
        host: String,
        port: u32,
        originator: String,
        originator_port: u32,
    },
}

impl ChannelKind {
    pub fn channel_type(&self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Session => write!(f, "session"),
            ChannelKind::DirectTcpip { host, port, .. } => {
                write!(f, "direct-tcpip {}:{}", host, port)
            }
        }
    }
}

/// Decision point for a channel the downstream client asked to open
#[async_trait]
pub trait ChannelAcceptor: Send {
    /// Confirm the open and hand over the channel
    async fn accept(self: Box<Self>) -> Result<ChannelEnd>;

    /// Refuse the open
    fn reject(self: Box<Self>);
}

/// A channel open waiting for the session to decide
pub struct IncomingChannel {
    pub kind: ChannelKind,
    pub acceptor: Box<dyn ChannelAcceptor>,
}

/// `AsyncRead` over a stream of data messages
///
/// One read never returns bytes from two messages, so a reader sized at
/// least as large as a message sees each message start at offset 0.
pub struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl ChunkReader {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for ChunkReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        while self.pending.is_empty() {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                // sender gone: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending.advance(n);
        Poll::Ready(Ok(()))
    }
}
