//! Control-plane IPC client
//!
//! One Unix stream socket carries both directions: audit events go out
//! through a single writer task, close commands come in through a reader
//! task and are dispatched to the callback registry.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{AuditSink, CallbackRegistry, CloseCallback, RegistrationId};
use crate::error::{Error, Result};
use crate::protocol::{ControlEvent, FrameCodec, InboundCommand, Way};

/// Connection timeout for the control socket
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound events buffered before new ones are dropped
const QUEUE_CAPACITY: usize = 1024;

/// Item on the writer queue
enum Outbound {
    Event(ControlEvent),
    /// Answered once everything queued before it has been written
    Flush(oneshot::Sender<()>),
}

/// Client side of the control-plane socket
pub struct ControlClient {
    events: mpsc::Sender<Outbound>,
    registry: Arc<CallbackRegistry>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ControlClient {
    /// Connect to the control plane and send the announcement first
    pub async fn connect<P: AsRef<Path>>(path: P, announce: ControlEvent) -> Result<Self> {
        let path = path.as_ref();
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path))
            .await
            .map_err(|_| {
                Error::ControlPlane(format!(
                    "Connection to control plane at {} timed out after {:?}",
                    path.display(),
                    CONNECT_TIMEOUT
                ))
            })?
            .map_err(|e| {
                Error::ControlPlane(format!(
                    "Failed to connect to control plane at {}: {}",
                    path.display(),
                    e
                ))
            })?;

        info!(path = %path.display(), "Connected to control plane");
        Self::from_stream(stream, announce)
    }

    /// Run the client over an already connected stream
    pub fn from_stream(stream: UnixStream, announce: ControlEvent) -> Result<Self> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (events, mut queue) = mpsc::channel::<Outbound>(QUEUE_CAPACITY);
        events
            .try_send(Outbound::Event(announce))
            .map_err(|e| Error::ControlPlane(format!("Failed to queue announcement: {}", e)))?;

        let writer = tokio::spawn(async move {
            while let Some(item) = queue.recv().await {
                let event = match item {
                    Outbound::Event(event) => event,
                    Outbound::Flush(done) => {
                        if done.send(()).is_err() {
                            trace!("Flush waiter went away");
                        }
                        continue;
                    }
                };
                trace!(kind = event.kind(), "Sending control event");
                match FrameCodec::write_event(&mut write_half, &event).await {
                    Ok(()) => {}
                    Err(Error::Io(e)) => {
                        warn!(error = %e, "Control plane write failed, dropping further events");
                        break;
                    }
                    Err(e) => warn!(kind = event.kind(), error = %e, "Dropping control event"),
                }
            }
        });

        let registry = Arc::new(CallbackRegistry::new());
        let dispatch = Arc::clone(&registry);
        let reader = tokio::spawn(async move {
            loop {
                let frame = match FrameCodec::read_frame(&mut read_half).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        info!("Control plane closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Control plane read failed");
                        break;
                    }
                };

                match InboundCommand::decode(&frame) {
                    Ok(command) => {
                        debug!(code = %command.code, way = ?command.way, "Control command received");
                        dispatch.dispatch(&command);
                    }
                    Err(e) => warn!(error = %e, "Ignoring control frame"),
                }
            }
        });

        Ok(Self {
            events,
            registry,
            writer,
            reader,
        })
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Whether the writer task is still accepting events
    pub fn is_connected(&self) -> bool {
        !self.events.is_closed() && !self.writer.is_finished()
    }

    /// Wait until every event queued so far has been written
    ///
    /// Gives up after `timeout`; events still queued then are lost.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let (done, written) = oneshot::channel();
        let drained = async {
            self.events
                .send(Outbound::Flush(done))
                .await
                .map_err(|_| Error::ControlPlane("Control plane writer stopped".to_string()))?;
            written
                .await
                .map_err(|_| Error::ControlPlane("Control plane writer stopped".to_string()))
        };
        tokio::time::timeout(timeout, drained).await.map_err(|_| {
            Error::ControlPlane(format!("Control queue not drained within {:?}", timeout))
        })?
    }
}

#[async_trait]
impl AuditSink for ControlClient {
    async fn emit(&self, event: ControlEvent) {
        let kind = event.kind();
        match self.events.try_send(Outbound::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(kind, "Control queue full, dropping event")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(kind, "Control plane gone, dropping event")
            }
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

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionIdentity;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    fn announce() -> ControlEvent {
        ControlEvent::AgentOnline {
            version: "0.1.0".to_string(),
            ssh_port: 8022,
            key: "k".to_string(),
            hostname: "h".to_string(),
        }
    }

    #[tokio::test]
    async fn test_announcement_then_events_in_order() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let client = ControlClient::from_stream(local, announce()).unwrap();

        let identity = SessionIdentity::new("abc", "127.0.0.1:9", Way::Terminal);
        client.emit(ControlEvent::open_connect(&identity)).await;
        client.emit(ControlEvent::log(&identity, b"ls\n")).await;

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let frame = FrameCodec::read_frame(&mut remote).await.unwrap().unwrap();
            let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["agent_online", "open_connect", "log"]);
    }

    #[tokio::test]
    async fn test_inbound_command_fires_callback() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let client = ControlClient::from_stream(local, announce()).unwrap();

        let (tx, rx) = oneshot::channel();
        client.register_close(
            "abc",
            Way::Terminal,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );

        // Junk frame is skipped, the command after it still works
        FrameCodec::write_frame(&mut remote, b"not json").await.unwrap();
        let body = serde_json::to_vec(&InboundCommand::close("abc", Some(Way::Terminal))).unwrap();
        FrameCodec::write_frame(&mut remote, &body).await.unwrap();
        remote.flush().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(client.registry().is_empty());
    }

    #[tokio::test]
    async fn test_deregister_keeps_callback_from_firing() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let client = ControlClient::from_stream(local, announce()).unwrap();

        let id = client
            .register_close("abc", Way::Web, Box::new(|| panic!("must not fire")))
            .unwrap();
        client.deregister_close("abc", Way::Web, id);
        assert_eq!(client.registry().dispatch(&InboundCommand::close("abc", None)), 0);
    }

    #[tokio::test]
    async fn test_flush_waits_for_queued_events() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let client = ControlClient::from_stream(local, announce()).unwrap();

        let identity = SessionIdentity::new("abc", "127.0.0.1:9", Way::Web);
        client.emit(ControlEvent::open_connect(&identity)).await;
        client.emit(ControlEvent::close_connect(&identity)).await;
        client.flush(Duration::from_secs(5)).await.unwrap();
        drop(client);

        let mut kinds = Vec::new();
        while let Some(frame) = FrameCodec::read_frame(&mut remote).await.unwrap() {
            let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
            kinds.push(value["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds, vec!["agent_online", "open_connect", "close_connect"]);
    }

    #[tokio::test]
    async fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let result = ControlClient::connect(dir.path().join("none.sock"), announce()).await;
        assert!(matches!(result, Err(Error::ControlPlane(_))));
    }
}
