//! End-to-end tests of proxy sessions over in-memory channels
//!
//! The downstream client and the upstream destination are both `MemoryPeer`s;
//! everything between them is the real session and relay code.

use rand::{Rng, RngCore};
use ssh_audit_proxy::control::{AuditSink, ControlClient};
use ssh_audit_proxy::protocol::{
    ChannelRequest, ControlEvent, FileEvent, FrameCodec, SessionIdentity, Way,
};
use ssh_audit_proxy::proxy::memory::{self, MemoryDownstream, MemoryPeer, MemorySink, MemoryUpstream};
use ssh_audit_proxy::proxy::{
    ChannelKind, IncomingChannel, ProxySession, SessionTracker, UpstreamConnection,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const CODE: &str = "abc123";

struct Harness {
    upstream: Arc<MemoryUpstream>,
    downstream: Arc<MemoryDownstream>,
    opens: mpsc::Sender<IncomingChannel>,
    opened: mpsc::UnboundedReceiver<(ChannelKind, MemoryPeer)>,
    task: JoinHandle<ssh_audit_proxy::Result<()>>,
}

impl Harness {
    fn start(sink: Arc<dyn AuditSink>, buffer_size: usize) -> Self {
        let (upstream, opened) = MemoryUpstream::new();
        let downstream = Arc::new(MemoryDownstream::default());
        let (opens, incoming) = mpsc::channel(4);
        let session = ProxySession::new(
            SessionIdentity::new(CODE, "192.0.2.10:50000", Way::Terminal),
            upstream.clone(),
            downstream.clone(),
            incoming,
        )
        .with_sink(sink)
        .with_buffer_size(buffer_size);

        Self {
            upstream,
            downstream,
            opens,
            opened,
            task: tokio::spawn(session.run()),
        }
    }

    /// Open a session channel; returns (client, destination) peers
    async fn open(&mut self) -> (MemoryPeer, MemoryPeer) {
        let (incoming, client, decided) = memory::incoming(ChannelKind::Session);
        self.opens.send(incoming).await.unwrap();
        assert!(decided.await.unwrap(), "channel open was refused");
        let (kind, server) = self.opened.recv().await.unwrap();
        assert_eq!(kind, ChannelKind::Session);
        (client, server)
    }

    async fn finish(self) -> ssh_audit_proxy::Result<()> {
        drop(self.opens);
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("session did not end")
            .expect("session panicked")
    }
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Send `data` in randomly sized writes
async fn send_in_pieces(peer: &MemoryPeer, data: &[u8]) {
    let mut offset = 0;
    while offset < data.len() {
        let len = rand::thread_rng().gen_range(1..=3000).min(data.len() - offset);
        assert!(peer.send_data(&data[offset..offset + len]).await);
        offset += len;
    }
}

#[tokio::test]
async fn test_subsystem_channel_is_byte_transparent_both_ways() {
    let sink = Arc::new(MemorySink::default());
    let mut harness = Harness::start(sink.clone(), 1024);
    let (mut client, mut server) = harness.open().await;

    let upload = random_payload(64 * 1024 + 17);
    let download = random_payload(48 * 1024 + 5);

    let expected_download = download.clone();
    let destination = tokio::spawn(async move {
        let (received, requests) = server.read_until_eof(true).await;
        send_in_pieces(&server, &expected_download).await;
        server.send_eof();
        (received, requests, server)
    });

    assert_eq!(
        client.request(ChannelRequest::subsystem(true, "netconf")).await,
        Some(true)
    );
    send_in_pieces(&client, &upload).await;
    client.send_eof();

    let (received, requests, _server) = destination.await.unwrap();
    assert_eq!(received, upload);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request_type, "subsystem");

    let (replied, _) = client.read_until_close(true).await;
    assert_eq!(replied, download);

    harness.finish().await.unwrap();
    // not sftp, not shell: nothing but the connection pair is reported
    assert_eq!(sink.kinds(), vec!["open_connect", "close_connect"]);
}

#[tokio::test]
async fn test_connect_and_disconnect_reported_once_per_login() {
    let sink = Arc::new(MemorySink::default());
    let mut harness = Harness::start(sink.clone(), 512);

    let mut peers = Vec::new();
    for _ in 0..4 {
        peers.push(harness.open().await);
    }
    for (client, _) in peers.iter_mut() {
        client.close();
    }

    let downstream = harness.downstream.clone();
    let upstream = harness.upstream.clone();
    harness.finish().await.unwrap();

    assert_eq!(sink.kinds(), vec!["open_connect", "close_connect"]);
    assert_eq!(downstream.close_count(), 1);
    assert!(upstream.is_closed());
}

#[tokio::test]
async fn test_sftp_upload_and_download_events() {
    let sink = Arc::new(MemorySink::default());
    let mut harness = Harness::start(sink.clone(), 4096);
    let (mut client, mut server) = harness.open().await;

    let destination = tokio::spawn(async move {
        let collected = server.read_until_eof(true).await;
        server.send_eof();
        (collected, server)
    });

    assert_eq!(
        client.request(ChannelRequest::subsystem(true, "sftp")).await,
        Some(true)
    );
    client.send_data(&sftp_open(1, "/srv/in/upload.bin")).await;
    client.send_data(&sftp_handle_op(6, 2)).await;
    client.send_data(&sftp_handle_op(4, 3)).await;
    client.send_data(&sftp_open(4, "/srv/out/report.csv")).await;
    client.send_data(&sftp_handle_op(5, 5)).await;
    client.send_eof();

    let (_collected, _server) = destination.await.unwrap();
    client.read_until_close(true).await;
    harness.finish().await.unwrap();

    let files: Vec<FileEvent> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ControlEvent::FileLog { data, .. } => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(
        files,
        vec![
            FileEvent::upload("/srv/in/upload.bin"),
            FileEvent::download("/srv/out/report.csv"),
        ]
    );
}

#[tokio::test]
async fn test_scp_download_reported_and_command_rerun() {
    let sink = Arc::new(MemorySink::default());
    let mut harness = Harness::start(sink.clone(), 1024);
    let (mut client, mut server) = harness.open().await;

    let destination = tokio::spawn(async move {
        let collected = server.read_until_eof(true).await;
        server.send_data(b"C0644 5 notes.txt\n").await;
        server.send_data(b"hello\0").await;
        server.send_request(ChannelRequest::exit_status(0)).await;
        server.send_eof();
        (collected, server)
    });

    assert_eq!(
        client.request(ChannelRequest::exec(true, b"scp -f notes.txt")).await,
        Some(true)
    );
    client.send_data(b"\0").await;
    client.send_eof();

    let ((data, _), _server) = destination.await.unwrap();
    assert_eq!(data, b"\0");

    let (out, requests) = client.read_until_close(true).await;
    assert_eq!(out, b"C0644 5 notes.txt\nhello\0");
    assert!(requests.iter().any(|r| r.request_type == "exit-status"));

    let upstream = harness.upstream.clone();
    harness.finish().await.unwrap();

    assert_eq!(upstream.commands(), vec!["scp -f notes.txt".to_string()]);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        ControlEvent::FileLog { data, .. } if *data == FileEvent::download("notes.txt")
    )));
}

#[tokio::test]
async fn test_plain_exec_runs_once_on_destination() {
    let sink = Arc::new(MemorySink::default());
    let mut harness = Harness::start(sink.clone(), 1024);
    let (mut client, mut server) = harness.open().await;

    let destination = tokio::spawn(async move {
        let collected = server.read_until_eof(true).await;
        server.send_data(b"x\n").await;
        server.send_request(ChannelRequest::exit_status(0)).await;
        server.send_eof();
        (collected, server)
    });

    assert_eq!(
        client.request(ChannelRequest::exec(true, b"echo x")).await,
        Some(true)
    );
    client.send_eof();

    let ((_, requests), _server) = destination.await.unwrap();
    assert_eq!(
        requests.iter().filter(|r| r.request_type == "exec").count(),
        1
    );
    let (out, _) = client.read_until_close(true).await;
    assert_eq!(out, b"x\n");

    let upstream = harness.upstream.clone();
    harness.finish().await.unwrap();
    assert!(upstream.commands().is_empty());
    assert_eq!(sink.kinds(), vec!["open_connect", "close_connect"]);
}

#[tokio::test]
async fn test_shutdown_drains_live_sessions() {
    let (stop, shutdown) = watch::channel(false);
    let (tracker, drain) = SessionTracker::new(shutdown);
    let sink = Arc::new(MemorySink::default());

    let mut peers = Vec::new();
    let mut upstreams = Vec::new();
    for _ in 0..2 {
        let (upstream, mut opened) = MemoryUpstream::new();
        let (opens, incoming) = mpsc::channel(4);
        tracker.spawn(
            ProxySession::new(
                SessionIdentity::new(CODE, "192.0.2.10:50000", Way::Terminal),
                upstream.clone(),
                Arc::new(MemoryDownstream::default()),
                incoming,
            )
            .with_sink(sink.clone()),
        );
        let (channel, client, decided) = memory::incoming(ChannelKind::Session);
        opens.send(channel).await.unwrap();
        assert!(decided.await.unwrap());
        let (_, server) = opened.recv().await.unwrap();
        peers.push((opens, client, server));
        upstreams.push(upstream);
    }
    assert_eq!(sink.registry().len(), 2);

    stop.send(true).unwrap();
    assert!(drain.wait(Duration::from_secs(10)).await);

    let mut kinds = sink.kinds();
    kinds.sort();
    assert_eq!(
        kinds,
        vec!["close_connect", "close_connect", "open_connect", "open_connect"]
    );
    assert!(upstreams.iter().all(|u| u.is_closed()));
    assert!(sink.registry().is_empty());
}

#[tokio::test]
async fn test_control_plane_close_ends_session_over_unix_socket() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("control.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    let announce = ControlEvent::AgentOnline {
        version: ssh_audit_proxy::VERSION.to_string(),
        ssh_port: 8022,
        key: "agent-key".to_string(),
        hostname: "edge-1".to_string(),
    };
    let connect = tokio::spawn(async move { ControlClient::connect(&socket, announce).await });
    let (mut plane, _) = listener.accept().await.unwrap();
    let client = Arc::new(connect.await.unwrap().unwrap());

    let mut harness = Harness::start(client.clone(), 1024);
    let (_client_peer, _server_peer) = harness.open().await;

    let mut seen = Vec::new();
    for _ in 0..2 {
        let frame = FrameCodec::read_frame(&mut plane).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
        seen.push(value["type"].as_str().unwrap().to_string());
    }
    assert_eq!(seen, vec!["agent_online", "open_connect"]);

    // no way given: the terminal callback fires after web finds nothing
    FrameCodec::write_frame(&mut plane, br#"{"code":"abc123"}"#)
        .await
        .unwrap();

    harness.finish().await.unwrap();

    let frame = FrameCodec::read_frame(&mut plane).await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&frame).unwrap();
    assert_eq!(value["type"], "close_connect");
    assert_eq!(value["code"], CODE);
    assert!(client.registry().is_empty());
}

fn sftp_packet(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
    packet.push(kind);
    packet.extend_from_slice(body);
    packet
}

fn sftp_open(id: u32, path: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&id.to_be_bytes());
    body.extend_from_slice(&(path.len() as u32).to_be_bytes());
    body.extend_from_slice(path.as_bytes());
    body.extend_from_slice(&0x0000_001au32.to_be_bytes());
    body.extend_from_slice(&0u32.to_be_bytes());
    sftp_packet(3, &body)
}

fn sftp_handle_op(kind: u8, id: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&id.to_be_bytes());
    body.extend_from_slice(&4u32.to_be_bytes());
    body.extend_from_slice(b"h001");
    body.extend_from_slice(&0u64.to_be_bytes());
    body.extend_from_slice(&32768u32.to_be_bytes());
    sftp_packet(kind, &body)
}
