//! Upstream leg: russh client connection to the destination host
//!
//! Every upstream channel is owned by an actor task that selects between
//! `Channel::wait` and a command queue, since russh needs `&mut` access to
//! read from a channel. Channel data is written through `make_writer` and
//! never goes through the actor.

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, AuthResult};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, Pty, Sig};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use super::channel::{ChannelControl, ChannelEnd, ChannelEvent, ChannelKind, ChunkReader};
use super::connection::{RemoteCommand, UpstreamConnection};
use crate::directory::Destination;
use crate::error::{Error, Result};
use crate::protocol::{ChannelRequest, RequestBody};

/// Buffered data messages per upstream channel
const DATA_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 32;

/// Dials destinations and authenticates as the resolved user
pub struct UpstreamDialer {
    config: Arc<client::Config>,
    connect_timeout: Duration,
    identity: Option<Arc<PrivateKey>>,
}

impl UpstreamDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            config: Arc::new(client::Config::default()),
            connect_timeout,
            identity: None,
        }
    }

    /// Use the key at `path` for public-key logins
    pub fn with_identity_file(mut self, path: &Path) -> Result<Self> {
        let key = russh::keys::load_secret_key(path, None)?;
        debug!(path = %path.display(), "Loaded upstream identity");
        self.identity = Some(Arc::new(key));
        Ok(self)
    }

    pub fn has_identity(&self) -> bool {
        self.identity.is_some()
    }

    pub async fn dial_password(&self, destination: &Destination, password: &str) -> Result<SshUpstream> {
        let target = destination.address();
        let dial = async {
            let (mut handle, closed) = self.connect(destination).await?;
            let result = handle
                .authenticate_password(destination.user.as_str(), password)
                .await
                .map_err(|e| Error::UpstreamDial(format!("{}: {}", target, e)))?;
            check_auth(result, destination)?;
            Ok(SshUpstream::new(handle, closed, target.clone()))
        };
        self.with_timeout(&target, dial).await
    }

    pub async fn dial_identity(&self, destination: &Destination) -> Result<SshUpstream> {
        let key = self.identity.clone().ok_or_else(|| {
            Error::UpstreamDial("no upstream identity configured".to_string())
        })?;
        let target = destination.address();
        let dial = async {
            let (mut handle, closed) = self.connect(destination).await?;
            let hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| Error::UpstreamDial(format!("{}: {}", target, e)))?
                .flatten();
            let result = handle
                .authenticate_publickey(destination.user.as_str(), PrivateKeyWithHashAlg::new(key, hash))
                .await
                .map_err(|e| Error::UpstreamDial(format!("{}: {}", target, e)))?;
            check_auth(result, destination)?;
            Ok(SshUpstream::new(handle, closed, target.clone()))
        };
        self.with_timeout(&target, dial).await
    }

    async fn with_timeout<F>(&self, target: &str, dial: F) -> Result<SshUpstream>
    where
        F: std::future::Future<Output = Result<SshUpstream>>,
    {
        tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| Error::UpstreamDial(format!("{}: timed out", target)))?
    }

    async fn connect(
        &self,
        destination: &Destination,
    ) -> Result<(client::Handle<UpstreamHandler>, watch::Receiver<bool>)> {
        let (closed_tx, closed) = watch::channel(false);
        let handler = UpstreamHandler {
            target: destination.address(),
            closed: closed_tx,
        };
        let handle = client::connect(
            Arc::clone(&self.config),
            (destination.host.as_str(), destination.port),
            handler,
        )
        .await
        .map_err(|e| Error::UpstreamDial(format!("{}: {}", destination.address(), e)))?;
        Ok((handle, closed))
    }
}

fn check_auth(result: AuthResult, destination: &Destination) -> Result<()> {
    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure { .. } => Err(Error::UpstreamDial(format!(
            "{}: authentication rejected for {}",
            destination.address(),
            destination.user
        ))),
    }
}

/// russh client callbacks; dropping it marks the connection closed
struct UpstreamHandler {
    target: String,
    closed: watch::Sender<bool>,
}

impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(
            target = %self.target,
            fingerprint = %server_public_key.fingerprint(russh::keys::HashAlg::Sha256),
            "Accepting upstream host key"
        );
        Ok(true)
    }
}

impl Drop for UpstreamHandler {
    fn drop(&mut self) {
        self.closed.send_replace(true);
        trace!(target = %self.target, "Upstream connection dropped");
    }
}

/// An authenticated upstream connection
pub struct SshUpstream {
    handle: client::Handle<UpstreamHandler>,
    closed: watch::Receiver<bool>,
    closing: AtomicBool,
    target: String,
}

impl SshUpstream {
    fn new(handle: client::Handle<UpstreamHandler>, closed: watch::Receiver<bool>, target: String) -> Self {
        Self {
            handle,
            closed,
            closing: AtomicBool::new(false),
            target,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl UpstreamConnection for SshUpstream {
    async fn open_channel(&self, kind: &ChannelKind) -> Result<ChannelEnd> {
        let channel = match kind {
            ChannelKind::Session => self.handle.channel_open_session().await,
            ChannelKind::DirectTcpip {
                host,
                port,
                originator,
                originator_port,
            } => {
                self.handle
                    .channel_open_direct_tcpip(host.clone(), *port, originator.clone(), *originator_port)
                    .await
            }
        }
        .map_err(|e| Error::ChannelOpen(format!("{} on {}: {}", kind, self.target, e)))?;

        trace!(target = %self.target, channel = %kind, "Upstream channel opened");
        Ok(spawn_channel(channel))
    }

    async fn start_command(&self, command: &str) -> Result<Box<dyn RemoteCommand>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::ChannelOpen(format!("command session on {}: {}", self.target, e)))?;
        channel.exec(true, format!("{}\n", command).into_bytes()).await?;
        channel.eof().await?;
        Ok(Box::new(SshCommand { channel }))
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            trace!(target = %self.target, error = %e, "Upstream disconnect failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || *self.closed.borrow() || self.handle.is_closed()
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

struct SshCommand {
    channel: russh::Channel<client::Msg>,
}

#[async_trait]
impl RemoteCommand for SshCommand {
    async fn wait(&mut self) -> Option<u32> {
        let mut status = None;
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        status
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.close().await {
            debug!(error = %e, "Command channel already closed");
        }
    }
}

enum Command {
    Request {
        request: ChannelRequest,
        reply: Option<oneshot::Sender<bool>>,
    },
    Extended {
        code: u32,
        data: Bytes,
    },
    Eof,
    Close,
}

struct UpstreamControl {
    commands: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
}

impl UpstreamControl {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Protocol("upstream channel closed".to_string()))
    }
}

#[async_trait]
impl ChannelControl for UpstreamControl {
    async fn send_request(&self, request: &ChannelRequest) -> Result<bool> {
        if !request.want_reply {
            self.send(Command::Request {
                request: request.clone(),
                reply: None,
            })?;
            return Ok(true);
        }

        let (reply, answer) = oneshot::channel();
        self.send(Command::Request {
            request: request.clone(),
            reply: Some(reply),
        })?;
        Ok(answer.await.unwrap_or(false))
    }

    // Nothing the destination sends on a client channel asks for a reply
    async fn reply(&self, _accepted: bool) -> Result<()> {
        Ok(())
    }

    async fn write_extended(&self, code: u32, data: &[u8]) -> Result<()> {
        self.send(Command::Extended {
            code,
            data: Bytes::copy_from_slice(data),
        })
    }

    async fn eof(&self) -> Result<()> {
        self.send(Command::Eof)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if self.commands.send(Command::Close).is_err() {
                trace!("Channel task already finished");
            }
        }
    }
}

fn spawn_channel(channel: russh::Channel<client::Msg>) -> ChannelEnd {
    let (data_tx, data_rx) = mpsc::channel(DATA_CAPACITY);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let writer = Box::pin(channel.make_writer());
    tokio::spawn(
        ChannelActor {
            channel,
            commands: commands_rx,
            data: Some(data_tx),
            events: events_tx,
            pending: VecDeque::new(),
        }
        .run(),
    );

    ChannelEnd {
        reader: Box::pin(ChunkReader::new(data_rx)),
        writer,
        control: Arc::new(UpstreamControl {
            commands: commands_tx,
            closed: AtomicBool::new(false),
        }),
        events: events_rx,
    }
}

struct ChannelActor {
    channel: russh::Channel<client::Msg>,
    commands: mpsc::UnboundedReceiver<Command>,
    data: Option<mpsc::Sender<Bytes>>,
    events: mpsc::Sender<ChannelEvent>,
    /// Replies owed to requests sent with `want_reply`, oldest first
    pending: VecDeque<oneshot::Sender<bool>>,
}

impl ChannelActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                msg = self.channel.wait() => {
                    let Some(msg) = msg else { break };
                    if !self.on_message(msg).await {
                        break;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Close) | None => {
                        if let Err(e) = self.channel.close().await {
                            debug!(error = %e, "Upstream channel already closed");
                        }
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                },
            }
        }
        trace!(channel = ?self.channel.id(), "Upstream channel actor finished");
    }

    /// Returns false once the channel is closed
    async fn on_message(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => {
                if let Some(tx) = &self.data {
                    if tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                        self.data = None;
                    }
                }
            }
            ChannelMsg::ExtendedData { data, ext } => {
                self.event(ChannelEvent::ExtendedData {
                    code: ext,
                    data: Bytes::copy_from_slice(&data),
                })
                .await;
            }
            ChannelMsg::Eof => self.data = None,
            ChannelMsg::Close => return false,
            ChannelMsg::Success => self.answer(true),
            ChannelMsg::Failure => self.answer(false),
            ChannelMsg::ExitStatus { exit_status } => {
                self.event(ChannelEvent::Request(ChannelRequest::exit_status(exit_status)))
                    .await;
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                lang_tag,
            } => {
                let request = ChannelRequest::exit_signal(
                    &signal_name_of(&signal_name),
                    core_dumped,
                    &error_message,
                    &lang_tag,
                );
                self.event(ChannelEvent::Request(request)).await;
            }
            ChannelMsg::XonXoff { client_can_do } => {
                self.event(ChannelEvent::Request(ChannelRequest::xon_xoff(client_can_do)))
                    .await;
            }
            _ => {}
        }
        true
    }

    async fn event(&self, event: ChannelEvent) {
        if self.events.send(event).await.is_err() {
            trace!("Upstream channel event dropped");
        }
    }

    fn answer(&mut self, accepted: bool) {
        if let Some(reply) = self.pending.pop_front() {
            if reply.send(accepted).is_err() {
                trace!(accepted, "Request reply no longer awaited");
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Request { request, reply } => self.send_request(request, reply).await,
            Command::Extended { code, data } => {
                if let Err(e) = self.channel.extended_data(code, &data[..]).await {
                    trace!(error = %e, "Upstream extended data failed");
                }
            }
            Command::Eof => {
                if let Err(e) = self.channel.eof().await {
                    trace!(error = %e, "Upstream EOF failed");
                }
            }
            Command::Close => {}
        }
    }

    async fn send_request(&mut self, request: ChannelRequest, reply: Option<oneshot::Sender<bool>>) {
        let want_reply = reply.is_some();
        let body = match request.decode() {
            Ok(body) => body,
            Err(e) => {
                debug!(request = %request.request_type, error = %e, "Undecodable channel request");
                self.settle(reply, false);
                return;
            }
        };

        let channel = &self.channel;
        let sent = match body {
            RequestBody::Pty {
                term,
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes,
            } => {
                let modes: Vec<(Pty, u32)> = modes
                    .into_iter()
                    .filter_map(|(op, value)| Pty::from_u8(op).map(|pty| (pty, value)))
                    .collect();
                channel
                    .request_pty(want_reply, &term, col_width, row_height, pix_width, pix_height, &modes)
                    .await
                    .map(|_| true)
            }
            RequestBody::Env { name, value } => channel.set_env(want_reply, name, value).await.map(|_| true),
            RequestBody::Shell => channel.request_shell(want_reply).await.map(|_| true),
            RequestBody::Exec { command } => channel.exec(want_reply, command.to_vec()).await.map(|_| true),
            RequestBody::Subsystem { name } => {
                channel.request_subsystem(want_reply, name).await.map(|_| true)
            }
            RequestBody::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            } => {
                // Sent without a reply request
                let result = channel.window_change(col_width, row_height, pix_width, pix_height).await;
                self.settle(reply, result.is_ok());
                return;
            }
            RequestBody::Signal { name } => {
                let result = channel.signal(signal_from_name(&name)).await;
                self.settle(reply, result.is_ok());
                return;
            }
            RequestBody::ExitStatus { .. }
            | RequestBody::ExitSignal { .. }
            | RequestBody::XonXoff { .. }
            | RequestBody::Unknown => {
                trace!(request = %request.request_type, "Request not supported on client channels");
                self.settle(reply, false);
                return;
            }
        };

        match (sent, reply) {
            (Ok(_), Some(reply)) => self.pending.push_back(reply),
            (Ok(_), None) => {}
            (Err(e), reply) => {
                debug!(request = %request.request_type, error = %e, "Upstream request failed");
                self.settle(reply, false);
            }
        }
    }

    /// Answer a request whose outcome is known without a peer reply
    fn settle(&self, reply: Option<oneshot::Sender<bool>>, accepted: bool) {
        if let Some(reply) = reply {
            if reply.send(accepted).is_err() {
                trace!(accepted, "Request reply no longer awaited");
            }
        }
    }
}

/// Name of a signal without the "SIG" prefix
pub(crate) fn signal_name_of(signal: &Sig) -> String {
    match signal {
        Sig::ABRT => "ABRT".to_string(),
        Sig::ALRM => "ALRM".to_string(),
        Sig::FPE => "FPE".to_string(),
        Sig::HUP => "HUP".to_string(),
        Sig::ILL => "ILL".to_string(),
        Sig::INT => "INT".to_string(),
        Sig::KILL => "KILL".to_string(),
        Sig::PIPE => "PIPE".to_string(),
        Sig::QUIT => "QUIT".to_string(),
        Sig::SEGV => "SEGV".to_string(),
        Sig::TERM => "TERM".to_string(),
        Sig::USR1 => "USR1".to_string(),
        Sig::Custom(name) => name.clone(),
    }
}

pub(crate) fn signal_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}
