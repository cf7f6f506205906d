//! Logging module for ssh-audit-proxy
//!
//! This module provides logging functionality using tracing and tracing-subscriber.
//! It supports:
//! - Configurable log levels via verbose/quiet flags or the `log_level` key
//! - JSONL file mirror of audit events
//! - Stderr output for human-readable logs

pub mod jsonl;

pub use jsonl::{AuditRecord, JsonlWriter};

use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity level adjustment: -1 for quiet, 0 for normal, +1 for verbose
    pub verbosity: i8,
    /// Level used when verbosity is 0, from the config file
    pub default_level: Option<String>,
    /// Optional path to the JSONL audit mirror
    pub jsonl_path: Option<String>,
}

impl LogConfig {
    /// Create a new log configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbose mode (+1 verbosity)
    pub fn verbose(mut self) -> Self {
        self.verbosity = 1;
        self
    }

    /// Set quiet mode (-1 verbosity)
    pub fn quiet(mut self) -> Self {
        self.verbosity = -1;
        self
    }

    /// Set the level used without --verbose/--quiet
    pub fn with_default_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = Some(level.into());
        self
    }

    /// Set JSONL output path
    pub fn with_jsonl_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.jsonl_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Get the minimum log level based on verbosity
    fn min_level(&self) -> Level {
        match self.verbosity {
            v if v < 0 => Level::WARN,
            0 => self
                .default_level
                .as_deref()
                .and_then(|l| l.parse().ok())
                .unwrap_or(Level::INFO),
            _ => Level::DEBUG,
        }
    }
}

/// Initialize logging for one-shot commands (no audit mirror)
pub fn init(verbose: bool, quiet: bool) -> LogGuard {
    let config = LogConfig {
        verbosity: if quiet {
            -1
        } else if verbose {
            1
        } else {
            0
        },
        ..LogConfig::default()
    };
    init_with_config(config)
}

/// Initialize logging with full configuration
///
/// Returns a guard that must be kept alive; it owns the JSONL mirror.
pub fn init_with_config(config: LogConfig) -> LogGuard {
    let level = config.min_level();

    // RUST_LOG overrides the computed default
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let jsonl_writer = config.jsonl_path.as_ref().and_then(|path| {
        JsonlWriter::new(path)
            .map_err(|e| {
                eprintln!("Warning: Failed to open JSONL log file '{}': {}", path, e);
            })
            .ok()
            .map(Arc::new)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer);

    // A subscriber may already be installed (tests, embedding)
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Warning: tracing subscriber already set");
    }

    LogGuard { jsonl_writer }
}

/// Guard that keeps logging resources alive
///
/// When dropped, the JSONL mirror is flushed once the last session using it
/// has finished.
#[must_use = "LogGuard must be kept alive for logging to work"]
pub struct LogGuard {
    jsonl_writer: Option<Arc<JsonlWriter>>,
}

impl LogGuard {
    /// The JSONL mirror, if configured, for use as an audit sink
    pub fn jsonl_writer(&self) -> Option<Arc<JsonlWriter>> {
        self.jsonl_writer.clone()
    }
}
