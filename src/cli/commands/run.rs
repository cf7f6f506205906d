//! Run command - execute the proxy in the foreground

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::args::RunArgs;
use crate::config::{ExpandedConfig, load_config_from_path_or_default};
use crate::control::{AuditSink, ControlClient, FanoutSink};
use crate::directory::DirectoryClient;
use crate::logging::{self, LogConfig};
use crate::protocol::ControlEvent;
use crate::proxy::{DirectoryHooks, ProxyServer, UpstreamDialer, load_host_key, server_config};

/// How long shutdown waits for queued control events to be written
const CONTROL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply command line overrides on top of the loaded configuration
pub fn apply_overrides(config: &mut ExpandedConfig, args: &RunArgs) -> Result<()> {
    if let Some(listen) = &args.listen {
        config.listen = listen
            .parse()
            .map_err(|e| crate::Error::Config(format!("Invalid listen address '{}': {}", listen, e)))?;
    }
    if let Some(host_key) = &args.host_key {
        config.host_key = host_key.clone();
    }
    if let Some(audit_log) = &args.audit_log {
        config.log_path = Some(audit_log.clone());
    }
    if let Some(key) = &args.key {
        config.agent_key = key.clone();
    }
    if let Some(hostname) = &args.hostname {
        config.agent_hostname = hostname.clone();
    }
    Ok(())
}

/// Execute the run command
pub async fn execute(
    args: RunArgs,
    config_path: Option<PathBuf>,
    verbose: bool,
    quiet: bool,
) -> Result<()> {
    let file = load_config_from_path_or_default(config_path.as_deref())?;
    let mut config = file.config.expand()?;
    apply_overrides(&mut config, &args)?;

    let mut log_config = LogConfig::new().with_default_level(&config.log_level);
    if verbose {
        log_config = log_config.verbose();
    } else if quiet {
        log_config = log_config.quiet();
    }
    if let Some(path) = &config.log_path {
        log_config = log_config.with_jsonl_path(path);
    }
    let log_guard = logging::init_with_config(log_config);

    if file.path.as_os_str().is_empty() {
        info!("Using default configuration");
    } else {
        info!(config = %file.path.display(), "Loaded configuration");
    }

    let mut sink = FanoutSink::new();
    let mut control = None;
    if let Some(socket) = &config.control_socket {
        let announce = ControlEvent::AgentOnline {
            version: crate::VERSION.to_string(),
            ssh_port: config.listen.port(),
            key: config.agent_key.clone(),
            hostname: config.agent_hostname.clone(),
        };
        let client = ControlClient::connect(socket, announce)
            .await
            .context("Failed to connect to the control plane")?;
        let client = Arc::new(client);
        sink = sink.with(client.clone());
        control = Some(client);
    } else {
        warn!("No control socket configured; audit events go to the JSONL log only");
    }
    if let (Some(writer), Some(path)) = (log_guard.jsonl_writer(), &config.log_path) {
        info!(log = %path.display(), "JSONL audit log enabled");
        sink = sink.with(writer);
    }
    let sink: Arc<dyn AuditSink> = Arc::new(sink);

    let directory = DirectoryClient::from_config(&config.directory)?;
    let mut dialer = UpstreamDialer::new(config.connect_timeout);
    if let Some(identity) = &config.identity_file {
        dialer = dialer
            .with_identity_file(identity)
            .with_context(|| format!("Failed to load identity file {}", identity.display()))?;
    }
    let hooks = Arc::new(DirectoryHooks::new(directory, dialer));

    let host_key = load_host_key(&config.host_key)?;
    let ssh_config = server_config(
        host_key,
        config.auth_rejection_time,
        config.inactivity_timeout,
    );

    let mut server = ProxyServer::new(config.listen.to_string(), ssh_config, hooks, sink)
        .with_buffer_size(config.buffer_size);
    let addr = server.bind().await?;

    info!(
        address = %addr,
        directory = %config.directory.host,
        "Starting ssh-audit-proxy"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

    info!("Proxy server started. Press Ctrl+C to stop.");

    let signalled = tokio::select! {
        result = shutdown_signal() => {
            result?;
            true
        }
        result = &mut server_task => {
            result.context("Listener task failed")??;
            false
        }
    };

    if signalled {
        info!("Received shutdown signal, stopping...");
        if shutdown_tx.send(true).is_err() {
            warn!("Listener already stopped");
        }
        // returns once live sessions have reported their disconnect
        server_task.await.context("Listener task failed")??;
    }

    if let Some(control) = control {
        if let Err(e) = control.flush(CONTROL_FLUSH_TIMEOUT).await {
            warn!(error = %e, "Control events lost on shutdown");
        }
    }

    info!("Shutdown complete");
    drop(log_guard);

    Ok(())
}

/// Wait for Ctrl-C or SIGTERM
async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to listen for SIGTERM")?;
    tokio::select! {
        result = signal::ctrl_c() => result.context("Failed to listen for shutdown signal")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
