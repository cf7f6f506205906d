//! Per-channel relay
//!
//! Each channel pair runs three activities:
//! - upload pump: client bytes to the destination, fed through the inspector
//! - reply pump: destination bytes to the client, logged while in shell mode
//! - request relay: out-of-band requests in both directions
//!
//! The request relay is the only writer of the channel's `RequestContext`;
//! the pumps read snapshots of it.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::channel::{BoxedReader, BoxedWriter, ChannelControl, ChannelEnd, ChannelEvent};
use super::completion::CompletionLatch;
use super::connection::UpstreamConnection;
use super::context::{self, ContextPublisher, ContextReader};
use super::hooks::SessionHooks;
use crate::control::AuditSink;
use crate::inspect::{Inspector, scp};
use crate::protocol::{ChannelRequest, ControlEvent, RequestKind, SessionIdentity};

/// Default read size of the data pumps
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Number of pumps per channel pair
const PUMP_COUNT: usize = 2;

/// How long teardown waits for the reply pump to flush buffered output
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the extra SCP command to finish
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Side a channel event arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Downstream,
    Upstream,
}

/// Relays one channel pair; cloned once per channel
#[derive(Clone)]
pub struct ChannelRelay {
    identity: Arc<SessionIdentity>,
    sink: Arc<dyn AuditSink>,
    upstream: Arc<dyn UpstreamConnection>,
    hooks: Option<Arc<dyn SessionHooks>>,
    buffer_size: usize,
}

impl ChannelRelay {
    pub fn new(
        identity: Arc<SessionIdentity>,
        sink: Arc<dyn AuditSink>,
        upstream: Arc<dyn UpstreamConnection>,
    ) -> Self {
        Self {
            identity,
            sink,
            upstream,
            hooks: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_hooks(mut self, hooks: Option<Arc<dyn SessionHooks>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Relay until the pair finishes, then close both channels
    pub async fn run(self, downstream: ChannelEnd, upstream: ChannelEnd) {
        let ChannelEnd {
            reader: down_reader,
            writer: down_writer,
            control: down,
            events: down_events,
        } = downstream;
        let ChannelEnd {
            reader: up_reader,
            writer: up_writer,
            control: up,
            events: up_events,
        } = upstream;

        let (publisher, context) = context::channel();
        let latch = CompletionLatch::new(PUMP_COUNT);

        let upload = tokio::spawn(
            Pump {
                role: PumpRole::Upload,
                target: Arc::clone(&up),
                context: context.clone(),
                latch: latch.clone(),
                identity: Arc::clone(&self.identity),
                sink: Arc::clone(&self.sink),
                buffer_size: self.buffer_size,
            }
            .run(down_reader, up_writer),
        );
        let upload = scopeguard::guard(upload, |task| task.abort());

        let up_reader = match &self.hooks {
            Some(hooks) => hooks.wrap_reader(&self.identity, up_reader),
            None => up_reader,
        };
        let reply = tokio::spawn(
            Pump {
                role: PumpRole::Reply,
                target: Arc::clone(&down),
                context,
                latch: latch.clone(),
                identity: Arc::clone(&self.identity),
                sink: Arc::clone(&self.sink),
                buffer_size: self.buffer_size,
            }
            .run(up_reader, down_writer),
        );
        let mut reply = scopeguard::guard(reply, |task| task.abort());

        let mut requests = RequestRelay {
            down: Arc::clone(&down),
            up: Arc::clone(&up),
            down_events,
            up_events,
            publisher,
        };
        self.relay_requests(&mut requests, &latch).await;

        // Upstream first so the reply pump drains what is still buffered
        up.close().await;
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut *reply).await.is_err() {
            debug!(code = %self.identity.code, "Reply pump did not drain in time");
        }
        down.close().await;
        drop(upload);
        trace!(code = %self.identity.code, "Channel pair closed");
    }

    async fn relay_requests(&self, requests: &mut RequestRelay, latch: &CompletionLatch) {
        loop {
            let Some((from, event)) = requests.next_event().await else {
                trace!(code = %self.identity.code, "Request stream ended");
                return;
            };

            let ChannelEvent::Request(request) = event else {
                requests.dispatch(from, event).await;
                continue;
            };

            match requests.forward(from, request).await {
                RequestKind::ExitStatus => return,
                RequestKind::Exec => {
                    self.run_exec(requests, latch).await;
                    return;
                }
                RequestKind::Subsystem => {
                    requests.wait_for_pumps(latch).await;
                    return;
                }
                RequestKind::Shell | RequestKind::Other => {}
            }
        }
    }

    /// Wait for both pumps of an exec channel
    ///
    /// SCP transfers also start their command on a separate upstream
    /// session, reaped once the pumps finish. Other commands already ran
    /// through the forwarded request and are never started a second time.
    async fn run_exec(&self, requests: &mut RequestRelay, latch: &CompletionLatch) {
        let command_line = requests.publisher.borrow().command.clone();
        let command = if scp::is_transfer(&command_line) {
            match self.upstream.start_command(&command_line).await {
                Ok(command) => Some(command),
                Err(e) => {
                    warn!(code = %self.identity.code, error = %e, "Failed to start SCP command upstream");
                    None
                }
            }
        } else {
            trace!(code = %self.identity.code, "Plain exec, no extra upstream command");
            None
        };

        requests.wait_for_pumps(latch).await;

        if let Some(mut command) = command {
            match tokio::time::timeout(REAP_TIMEOUT, command.wait()).await {
                Ok(status) => debug!(code = %self.identity.code, status = ?status, "SCP command reaped"),
                Err(_) => debug!(code = %self.identity.code, "SCP command still running, closing it"),
            }
            command.close().await;
        }
    }
}

/// Request streams and controls of both sides
struct RequestRelay {
    down: Arc<dyn ChannelControl>,
    up: Arc<dyn ChannelControl>,
    down_events: mpsc::Receiver<ChannelEvent>,
    up_events: mpsc::Receiver<ChannelEvent>,
    publisher: ContextPublisher,
}

impl RequestRelay {
    /// Next event from either side, or `None` once either side has closed
    ///
    /// Events the other side had already queued are relayed before `None`.
    async fn next_event(&mut self) -> Option<(Side, ChannelEvent)> {
        let (side, event) = tokio::select! {
            event = self.down_events.recv() => (Side::Downstream, event),
            event = self.up_events.recv() => (Side::Upstream, event),
        };
        match event {
            Some(event) => Some((side, event)),
            None => {
                trace!(side = ?side, "Event stream ended");
                self.drain_pending().await;
                None
            }
        }
    }

    /// (source, target) controls for an event that arrived on `from`
    fn route(&self, from: Side) -> (&Arc<dyn ChannelControl>, &Arc<dyn ChannelControl>) {
        match from {
            Side::Downstream => (&self.down, &self.up),
            Side::Upstream => (&self.up, &self.down),
        }
    }

    async fn dispatch(&mut self, from: Side, event: ChannelEvent) {
        match event {
            ChannelEvent::Request(request) => {
                self.forward(from, request).await;
            }
            ChannelEvent::ExtendedData { code, data } => {
                let (_, target) = self.route(from);
                if let Err(e) = target.write_extended(code, &data).await {
                    debug!(error = %e, "Failed to relay extended data");
                }
            }
        }
    }

    /// Record the request in the context, send it to the other side and
    /// pass the answer back
    async fn forward(&mut self, from: Side, request: ChannelRequest) -> RequestKind {
        self.publisher.send_modify(|ctx| ctx.observe(&request));

        let (source, target) = self.route(from);
        trace!(
            request = %request.request_type,
            want_reply = request.want_reply,
            from = ?from,
            "Relaying channel request"
        );

        let accepted = match target.send_request(&request).await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(request = %request.request_type, error = %e, "Request relay failed");
                false
            }
        };

        if request.want_reply {
            if let Err(e) = source.reply(accepted).await {
                debug!(request = %request.request_type, error = %e, "Failed to answer request");
            }
        }

        request.kind()
    }

    /// Keep relaying requests until both pumps finish or a side closes
    async fn wait_for_pumps(&mut self, latch: &CompletionLatch) {
        loop {
            tokio::select! {
                _ = latch.wait() => {
                    self.drain_pending().await;
                    return;
                }
                next = self.next_event() => match next {
                    Some((from, event)) => self.dispatch(from, event).await,
                    None => return,
                },
            }
        }
    }

    /// Relay events already queued on either side, such as an exit status
    /// that arrived just before the channel's EOF
    async fn drain_pending(&mut self) {
        loop {
            let next = match self.up_events.try_recv() {
                Ok(event) => (Side::Upstream, event),
                Err(_) => match self.down_events.try_recv() {
                    Ok(event) => (Side::Downstream, event),
                    Err(_) => return,
                },
            };
            self.dispatch(next.0, next.1).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpRole {
    /// Client to destination, inspected for file transfers
    Upload,
    /// Destination to client, logged as a transcript in shell mode
    Reply,
}

struct Pump {
    role: PumpRole,
    /// Control of the channel being written to
    target: Arc<dyn ChannelControl>,
    context: ContextReader,
    latch: CompletionLatch,
    identity: Arc<SessionIdentity>,
    sink: Arc<dyn AuditSink>,
    buffer_size: usize,
}

impl Pump {
    async fn run(self, mut reader: BoxedReader, mut writer: BoxedWriter) {
        // Counted down on every exit, including a panic
        let latch = self.latch.clone();
        let _done = scopeguard::guard(latch, |latch| latch.count_down());

        let mut inspector = Inspector::new();
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    trace!(role = ?self.role, error = %e, "Pump read ended");
                    return;
                }
            };
            let chunk = &buf[..n];

            if let Err(e) = writer.write_all(chunk).await {
                trace!(role = ?self.role, error = %e, "Pump write ended");
                return;
            }

            if let Some(event) = self.audit(&mut inspector, chunk) {
                self.sink.emit(event).await;
            }
        }

        // Source reached EOF: pass it on
        if let Err(e) = writer.flush().await {
            trace!(role = ?self.role, error = %e, "Pump flush failed");
            return;
        }
        if let Err(e) = self.target.eof().await {
            trace!(role = ?self.role, error = %e, "Failed to forward EOF");
        }
    }

    fn audit(&self, inspector: &mut Inspector, chunk: &[u8]) -> Option<ControlEvent> {
        let ctx = self.context.borrow();
        match self.role {
            PumpRole::Upload => inspector
                .inspect(&ctx, chunk)
                .map(|event| ControlEvent::file_log(&self.identity, event)),
            PumpRole::Reply if ctx.request_type == RequestKind::Shell => {
                Some(ControlEvent::log(&self.identity, chunk))
            }
            PumpRole::Reply => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::sftp::tests::{handle_packet, open_packet};
    use crate::inspect::sftp::SSH_FXP_READ;
    use crate::protocol::{FileEvent, Way};
    use crate::proxy::memory::{self, MemorySink, MemoryUpstream, PeerMessage};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;

    fn relay(sink: Arc<MemorySink>, upstream: Arc<MemoryUpstream>) -> ChannelRelay {
        let identity = Arc::new(SessionIdentity::new("abc123", "127.0.0.1:40000", Way::Terminal));
        ChannelRelay::new(identity, sink, upstream)
    }

    #[tokio::test]
    async fn test_shell_output_is_logged_verbatim() {
        let sink = Arc::new(MemorySink::default());
        let (upstream, _opened) = MemoryUpstream::new();
        let (down_end, mut client) = memory::pair();
        let (up_end, mut server) = memory::pair();
        let task = tokio::spawn(relay(sink.clone(), upstream).run(down_end, up_end));

        assert!(client.send_request(ChannelRequest::shell(true)).await);
        match server.recv().await {
            Some(PeerMessage::Request { request, reply }) => {
                assert_eq!(request.request_type, "shell");
                reply.unwrap().send(true).unwrap();
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(client.recv().await, Some(PeerMessage::Reply(true)));

        server.send_data(b"hello\r\n").await;
        assert_eq!(client.recv().await, Some(PeerMessage::Data(bytes::Bytes::from_static(b"hello\r\n"))));

        server.send_request(ChannelRequest::exit_status(0)).await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let logs: Vec<Vec<u8>> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ControlEvent::Log { data, .. } => Some(BASE64.decode(data).unwrap()),
                _ => None,
            })
            .collect();
        assert_eq!(logs, vec![b"hello\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_window_change_ends_shell_transcript() {
        let sink = Arc::new(MemorySink::default());
        let (upstream, _opened) = MemoryUpstream::new();
        let (down_end, mut client) = memory::pair();
        let (up_end, mut server) = memory::pair();
        let task = tokio::spawn(relay(sink.clone(), upstream).run(down_end, up_end));

        assert!(client.send_request(ChannelRequest::shell(false)).await);
        match server.recv().await {
            Some(PeerMessage::Request { request, .. }) => assert_eq!(request.request_type, "shell"),
            other => panic!("unexpected: {:?}", other),
        }
        server.send_data(b"before\r\n").await;
        assert_eq!(client.recv().await, Some(PeerMessage::Data(bytes::Bytes::from_static(b"before\r\n"))));
        // the pump audits right after its write
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.events().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(client.send_request(ChannelRequest::window_change(120, 40, 0, 0)).await);
        match server.recv().await {
            Some(PeerMessage::Request { request, .. }) => assert_eq!(request.request_type, "window-change"),
            other => panic!("unexpected: {:?}", other),
        }
        server.send_data(b"after\r\n").await;
        assert_eq!(client.recv().await, Some(PeerMessage::Data(bytes::Bytes::from_static(b"after\r\n"))));

        server.send_request(ChannelRequest::exit_status(0)).await;
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let logs: Vec<Vec<u8>> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ControlEvent::Log { data, .. } => Some(BASE64.decode(data).unwrap()),
                _ => None,
            })
            .collect();
        assert_eq!(logs, vec![b"before\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_sftp_download_is_reported() {
        let sink = Arc::new(MemorySink::default());
        let (upstream, _opened) = MemoryUpstream::new();
        let (down_end, mut client) = memory::pair();
        let (up_end, mut server) = memory::pair();
        let task = tokio::spawn(relay(sink.clone(), upstream).run(down_end, up_end));

        let answer = tokio::spawn(async move {
            // answer the subsystem request, then collect data until EOF
            let collected = server.read_until_eof(true).await;
            (server, collected)
        });

        assert_eq!(client.request(ChannelRequest::subsystem(true, "sftp")).await, Some(true));
        client.send_data(&open_packet(1, "report.csv")).await;
        client.send_data(&handle_packet(SSH_FXP_READ, 2)).await;
        client.send_eof();

        let (mut server, (data, requests)) = answer.await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(data.len(), open_packet(1, "report.csv").len() + handle_packet(SSH_FXP_READ, 2).len());

        server.send_eof();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let files: Vec<FileEvent> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ControlEvent::FileLog { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(files, vec![FileEvent::download("report.csv")]);
    }

    #[tokio::test]
    async fn test_exec_starts_command_and_waits_for_pumps() {
        let sink = Arc::new(MemorySink::default());
        let (upstream, _opened) = MemoryUpstream::new();
        let (down_end, mut client) = memory::pair();
        let (up_end, mut server) = memory::pair();
        let task = tokio::spawn(relay(sink.clone(), upstream.clone()).run(down_end, up_end));

        let server_task = tokio::spawn(async move {
            let collected = server.read_until_eof(true).await;
            server.send_data(b"done\n").await;
            server.send_request(ChannelRequest::exit_status(0)).await;
            server.send_eof();
            collected
        });

        assert_eq!(
            client.request(ChannelRequest::exec(true, b"scp -t /tmp/x")).await,
            Some(true)
        );
        client.send_data(b"C0644 3 x\n").await;
        client.send_eof();

        let (data, _) = server_task.await.unwrap();
        assert_eq!(data, b"C0644 3 x\n");

        let (out, requests) = client.read_until_close(true).await;
        assert_eq!(out, b"done\n");
        assert!(requests.iter().any(|r| r.request_type == "exit-status"));

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(upstream.commands(), vec!["scp -t /tmp/x".to_string()]);
        assert!(sink.events().iter().any(|e| matches!(
            e,
            ControlEvent::FileLog { data, .. } if *data == FileEvent::upload("x")
        )));
    }

    #[tokio::test]
    async fn test_plain_exec_reaches_destination_once() {
        let sink = Arc::new(MemorySink::default());
        let (upstream, _opened) = MemoryUpstream::new();
        let (down_end, mut client) = memory::pair();
        let (up_end, mut server) = memory::pair();
        let task = tokio::spawn(relay(sink.clone(), upstream.clone()).run(down_end, up_end));

        let server_task = tokio::spawn(async move {
            let collected = server.read_until_eof(true).await;
            server.send_data(b"x\n").await;
            server.send_request(ChannelRequest::exit_status(0)).await;
            server.send_eof();
            collected
        });

        assert_eq!(
            client.request(ChannelRequest::exec(true, b"echo x >> f")).await,
            Some(true)
        );
        client.send_eof();

        let (_, requests) = server_task.await.unwrap();
        let execs: Vec<_> = requests.iter().filter(|r| r.request_type == "exec").collect();
        assert_eq!(execs.len(), 1);

        let (out, _) = client.read_until_close(true).await;
        assert_eq!(out, b"x\n");
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        // the forwarded request is the only execution
        assert!(upstream.commands().is_empty());
        assert!(!sink.events().iter().any(|e| matches!(e, ControlEvent::FileLog { .. })));
    }

    #[tokio::test]
    async fn test_request_queued_before_other_side_closes_is_relayed() {
        // both streams are ready when the relay starts; repeat so either
        // select branch gets picked first
        for _ in 0..16 {
            let sink = Arc::new(MemorySink::default());
            let (upstream, _opened) = MemoryUpstream::new();
            let (down_end, client) = memory::pair();
            let (up_end, mut server) = memory::pair();

            assert!(client.send_request(ChannelRequest::signal("INT")).await);
            server.close();
            tokio::time::sleep(Duration::from_millis(10)).await;

            let task = tokio::spawn(relay(sink, upstream).run(down_end, up_end));
            tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

            let mut signals = 0;
            while let Some(msg) = server.recv().await {
                if let PeerMessage::Request { request, .. } = msg {
                    if request.request_type == "signal" {
                        signals += 1;
                    }
                }
            }
            assert_eq!(signals, 1);
            drop(client);
        }
    }

    #[tokio::test]
    async fn test_closed_side_ends_relay_and_closes_both() {
        let sink = Arc::new(MemorySink::default());
        let (upstream, _opened) = MemoryUpstream::new();
        let (down_end, mut client) = memory::pair();
        let (up_end, mut server) = memory::pair();
        let task = tokio::spawn(relay(sink, upstream).run(down_end, up_end));

        client.close();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let mut saw_close = false;
        while let Some(msg) = server.recv().await {
            if msg == PeerMessage::Close {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }
}
