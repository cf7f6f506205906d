//! Downstream leg: channels of the connection accepted by the russh server
//!
//! russh hands every request on a server channel to the `Channel` object as
//! a `ChannelMsg`. A reader task turns those into channel data and
//! `ChannelEvent`s; answers and outbound requests go through the session
//! `Handle`.

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{self, Handle};
use russh::{ChannelId, ChannelMsg, CryptoVec, Disconnect, Pty};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::channel::{ChannelAcceptor, ChannelControl, ChannelEnd, ChannelEvent, ChunkReader};
use super::connection::DownstreamConnection;
use super::upstream::{signal_from_name, signal_name_of};
use crate::error::{Error, Result};
use crate::protocol::{ChannelRequest, RequestBody};

const DATA_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 32;

/// A downstream channel open awaiting the session's decision
///
/// The russh handler waits on the other end of `decision` before it
/// confirms or refuses the open.
pub struct SshChannelAcceptor {
    channel: russh::Channel<server::Msg>,
    handle: Handle,
    decision: oneshot::Sender<bool>,
}

impl SshChannelAcceptor {
    pub fn new(
        channel: russh::Channel<server::Msg>,
        handle: Handle,
        decision: oneshot::Sender<bool>,
    ) -> Self {
        Self {
            channel,
            handle,
            decision,
        }
    }
}

#[async_trait]
impl ChannelAcceptor for SshChannelAcceptor {
    async fn accept(self: Box<Self>) -> Result<ChannelEnd> {
        let Self {
            channel,
            handle,
            decision,
        } = *self;
        if decision.send(true).is_err() {
            return Err(Error::ChannelOpen(
                "downstream connection went away".to_string(),
            ));
        }
        Ok(spawn_channel(channel, handle))
    }

    fn reject(self: Box<Self>) {
        if self.decision.send(false).is_err() {
            debug!("Channel open already abandoned, rejection not delivered");
        }
    }
}

fn spawn_channel(channel: russh::Channel<server::Msg>, handle: Handle) -> ChannelEnd {
    let id = channel.id();
    let (data_tx, data_rx) = mpsc::channel(DATA_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

    let writer = Box::pin(channel.make_writer());
    tokio::spawn(
        ChannelReader {
            channel,
            handle: handle.clone(),
            data: Some(data_tx),
            events: events_tx,
        }
        .run(),
    );

    ChannelEnd {
        reader: Box::pin(ChunkReader::new(data_rx)),
        writer,
        control: Arc::new(DownstreamControl {
            handle,
            id,
            closed: AtomicBool::new(false),
        }),
        events: events_rx,
    }
}

struct ChannelReader {
    channel: russh::Channel<server::Msg>,
    handle: Handle,
    data: Option<mpsc::Sender<Bytes>>,
    events: mpsc::Sender<ChannelEvent>,
}

impl ChannelReader {
    async fn run(mut self) {
        while let Some(msg) = self.channel.wait().await {
            let request = match msg {
                ChannelMsg::Data { data } => {
                    if let Some(tx) = &self.data {
                        if tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                            self.data = None;
                        }
                    }
                    continue;
                }
                ChannelMsg::ExtendedData { data, ext } => {
                    self.event(ChannelEvent::ExtendedData {
                        code: ext,
                        data: Bytes::copy_from_slice(&data),
                    })
                    .await;
                    continue;
                }
                ChannelMsg::Eof => {
                    self.data = None;
                    continue;
                }
                ChannelMsg::Close => break,
                ChannelMsg::RequestPty {
                    want_reply,
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    terminal_modes,
                } => {
                    let modes: Vec<(u8, u32)> = terminal_modes
                        .iter()
                        .take_while(|(pty, _)| *pty != Pty::TTY_OP_END)
                        .map(|(pty, value)| (*pty as u8, *value))
                        .collect();
                    ChannelRequest::pty(want_reply, &term, col_width, row_height, pix_width, pix_height, &modes)
                }
                ChannelMsg::SetEnv {
                    want_reply,
                    variable_name,
                    variable_value,
                } => ChannelRequest::env(want_reply, &variable_name, &variable_value),
                ChannelMsg::RequestShell { want_reply } => ChannelRequest::shell(want_reply),
                ChannelMsg::Exec { want_reply, command } => ChannelRequest::exec(want_reply, &command),
                ChannelMsg::RequestSubsystem { want_reply, name } => {
                    ChannelRequest::subsystem(want_reply, &name)
                }
                ChannelMsg::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                } => ChannelRequest::window_change(col_width, row_height, pix_width, pix_height),
                ChannelMsg::Signal { signal } => ChannelRequest::signal(&signal_name_of(&signal)),
                ChannelMsg::RequestX11 { .. } => {
                    debug!(channel = ?self.channel.id(), "Refusing X11 forwarding");
                    if self.handle.channel_failure(self.channel.id()).await.is_err() {
                        debug!(channel = ?self.channel.id(), "Connection gone before X11 refusal");
                    }
                    continue;
                }
                other => {
                    trace!(channel = ?self.channel.id(), msg = ?other, "Ignoring downstream channel message");
                    continue;
                }
            };
            self.event(ChannelEvent::Request(request)).await;
        }
        trace!(channel = ?self.channel.id(), "Downstream channel reader finished");
    }

    async fn event(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Downstream channel event dropped");
        }
    }
}

struct DownstreamControl {
    handle: Handle,
    id: ChannelId,
    closed: AtomicBool,
}

impl DownstreamControl {
    fn gone(&self) -> Error {
        Error::Protocol(format!("downstream channel {:?} is gone", self.id))
    }
}

#[async_trait]
impl ChannelControl for DownstreamControl {
    /// Requests a server may send on a session channel
    async fn send_request(&self, request: &ChannelRequest) -> Result<bool> {
        match request.decode()? {
            RequestBody::ExitStatus { code } => self
                .handle
                .exit_status_request(self.id, code)
                .await
                .map(|_| true)
                .map_err(|_| self.gone()),
            RequestBody::ExitSignal {
                name,
                core_dumped,
                message,
                lang,
            } => self
                .handle
                .exit_signal_request(self.id, signal_from_name(&name), core_dumped, message, lang)
                .await
                .map(|_| true)
                .map_err(|_| self.gone()),
            _ => {
                trace!(request = %request.request_type, "Request not supported on server channels");
                Ok(false)
            }
        }
    }

    async fn reply(&self, accepted: bool) -> Result<()> {
        let result = if accepted {
            self.handle.channel_success(self.id).await
        } else {
            self.handle.channel_failure(self.id).await
        };
        result.map_err(|_| self.gone())
    }

    async fn write_extended(&self, code: u32, data: &[u8]) -> Result<()> {
        self.handle
            .extended_data(self.id, code, CryptoVec::from_slice(data))
            .await
            .map_err(|_| self.gone())
    }

    async fn eof(&self) -> Result<()> {
        self.handle.eof(self.id).await.map_err(|_| self.gone())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if self.handle.close(self.id).await.is_err() {
                debug!(channel = ?self.id, "Connection gone before channel close");
            }
        }
    }
}

/// The accepted client connection
pub struct SshDownstream {
    handle: Handle,
    closed: AtomicBool,
}

impl SshDownstream {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DownstreamConnection for SshDownstream {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed".to_string(), "en".to_string())
            .await
        {
            trace!(error = %e, "Downstream disconnect failed");
        }
    }
}
