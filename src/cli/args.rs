//! Argument structures for CLI commands

use clap::Args;
use std::path::PathBuf;

/// Arguments for the `run` command
///
/// Every flag overrides the matching configuration file setting.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Listen address, e.g. 0.0.0.0:8022
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Host private key path
    #[arg(long, value_name = "PATH")]
    pub host_key: Option<PathBuf>,

    /// Path to the JSONL audit log
    #[arg(long, value_name = "PATH")]
    pub audit_log: Option<PathBuf>,

    /// Agent key announced to the control plane
    #[arg(long, value_name = "KEY", env = "SSH_AUDIT_PROXY_KEY")]
    pub key: Option<String>,

    /// Agent hostname announced to the control plane
    #[arg(long, value_name = "HOST")]
    pub hostname: Option<String>,
}

/// Arguments for the `config` command
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Validate configuration only
    #[arg(long)]
    pub validate: bool,

    /// Show configuration search paths
    #[arg(long)]
    pub paths: bool,

    /// Show default configuration
    #[arg(long)]
    pub show_default: bool,

    /// Output format
    #[arg(short, long, default_value = "toml", value_parser = ["toml", "json"])]
    pub format: String,
}
