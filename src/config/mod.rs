//! Configuration module for ssh-audit-proxy
//!
//! This module handles loading and parsing of configuration files,
//! including environment variable expansion and duration parsing.

mod file;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub use file::{
    ConfigFile, SearchLocation, config_search_paths, find_config_file, load_config,
    load_config_from_path_or_default,
};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Stderr log level used when neither --verbose nor --quiet is given
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path to the JSONL audit mirror
    /// Supports environment variable and tilde expansion
    #[serde(default)]
    pub log_path: Option<String>,

    /// SSH listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Tunnel directory service
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Control-plane IPC socket
    #[serde(default)]
    pub control: ControlConfig,

    /// Upstream SSH client settings
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Channel relay tuning
    #[serde(default)]
    pub relay: RelayConfig,
}

/// SSH listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:8022"
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Host private key path
    #[serde(default = "default_host_key")]
    pub host_key: String,

    /// Delay before answering a rejected authentication attempt
    #[serde(default = "default_auth_rejection_time")]
    pub auth_rejection_time: String,

    /// Idle timeout for downstream connections
    #[serde(default)]
    pub inactivity_timeout: Option<String>,
}

/// Directory service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    /// Directory service host[:port]
    #[serde(default = "default_directory_host")]
    pub host: String,

    /// Use https instead of http
    #[serde(default)]
    pub ssl: bool,

    /// Access token appended to every lookup
    #[serde(default = "default_directory_token")]
    pub token: String,

    /// Request timeout
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

/// Control-plane configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    /// Unix socket of the control plane
    #[serde(default)]
    pub socket: Option<String>,

    /// Agent key announced to the control plane
    #[serde(default)]
    pub key: String,

    /// Agent hostname announced to the control plane
    #[serde(default)]
    pub hostname: String,
}

/// Upstream SSH client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Connect + handshake + auth timeout
    #[serde(default = "default_timeout")]
    pub connect_timeout: String,

    /// Private key used upstream for public-key logins
    #[serde(default)]
    pub identity_file: Option<String>,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Data-pump read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_path: None,
            server: ServerConfig::default(),
            directory: DirectoryConfig::default(),
            control: ControlConfig::default(),
            upstream: UpstreamConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_key: default_host_key(),
            auth_rejection_time: default_auth_rejection_time(),
            inactivity_timeout: None,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            host: default_directory_host(),
            ssl: false,
            token: default_directory_token(),
            timeout: default_timeout(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_timeout(),
            identity_file: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8022".to_string()
}

fn default_host_key() -> String {
    "./id_rsa".to_string()
}

fn default_auth_rejection_time() -> String {
    "1s".to_string()
}

fn default_directory_host() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_directory_token() -> String {
    "333d9987c1b560".to_string()
}

fn default_timeout() -> String {
    "10s".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

impl Config {
    /// Resolve paths, addresses and durations into their runtime form
    pub fn expand(&self) -> crate::Result<ExpandedConfig> {
        let listen: SocketAddr = self.server.listen.parse().map_err(|e| {
            crate::Error::Config(format!(
                "Invalid listen address '{}': {}",
                self.server.listen, e
            ))
        })?;

        if self.relay.buffer_size == 0 {
            return Err(crate::Error::Config(
                "relay.buffer_size must be greater than zero".to_string(),
            ));
        }

        Ok(ExpandedConfig {
            log_level: self.log_level.clone(),
            log_path: self
                .log_path
                .as_deref()
                .map(expand_path)
                .transpose()?
                .map(PathBuf::from),
            listen,
            host_key: PathBuf::from(expand_path(&self.server.host_key)?),
            auth_rejection_time: parse_duration(&self.server.auth_rejection_time)?,
            inactivity_timeout: self
                .server
                .inactivity_timeout
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            directory: ExpandedDirectoryConfig {
                host: self.directory.host.clone(),
                ssl: self.directory.ssl,
                token: self.directory.token.clone(),
                timeout: parse_duration(&self.directory.timeout)?,
            },
            control_socket: self
                .control
                .socket
                .as_deref()
                .map(expand_path)
                .transpose()?
                .map(PathBuf::from),
            agent_key: self.control.key.clone(),
            agent_hostname: self.control.hostname.clone(),
            connect_timeout: parse_duration(&self.upstream.connect_timeout)?,
            identity_file: self
                .upstream
                .identity_file
                .as_deref()
                .map(expand_path)
                .transpose()?
                .map(PathBuf::from),
            buffer_size: self.relay.buffer_size,
        })
    }
}

/// Configuration with paths expanded and durations parsed
#[derive(Debug, Clone)]
pub struct ExpandedConfig {
    pub log_level: String,
    pub log_path: Option<PathBuf>,
    pub listen: SocketAddr,
    pub host_key: PathBuf,
    pub auth_rejection_time: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub directory: ExpandedDirectoryConfig,
    pub control_socket: Option<PathBuf>,
    pub agent_key: String,
    pub agent_hostname: String,
    pub connect_timeout: Duration,
    pub identity_file: Option<PathBuf>,
    pub buffer_size: usize,
}

/// Directory settings with parsed timeout
#[derive(Debug, Clone)]
pub struct ExpandedDirectoryConfig {
    pub host: String,
    pub ssl: bool,
    pub token: String,
    pub timeout: Duration,
}

/// Expand environment variables and tilde in a path string
pub fn expand_path(path: &str) -> crate::Result<String> {
    shellexpand::full(path)
        .map(|s| s.into_owned())
        .map_err(|e| crate::Error::Config(format!("Failed to expand path '{}': {}", path, e)))
}

/// Parse a duration string like "1h", "30m", "10s", "1d"
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::Config("Empty duration string".to_string()));
    }

    let (num_str, unit) = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| (&s[..i], &s[i..]))
        .unwrap_or((s, "s"));

    let num: u64 = num_str.trim().parse().map_err(|e| {
        crate::Error::Config(format!("Invalid duration number '{}': {}", num_str, e))
    })?;

    let duration = match unit.to_lowercase().as_str() {
        "ms" | "msec" | "millis" => return Ok(Duration::from_millis(num)),
        "s" | "sec" | "secs" | "second" | "seconds" | "" => num,
        "m" | "min" | "mins" | "minute" | "minutes" => num * 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => num * 60 * 60,
        "d" | "day" | "days" => num * 60 * 60 * 24,
        _ => {
            return Err(crate::Error::Config(format!(
                "Unknown duration unit '{}' in '{}'",
                unit, s
            )));
        }
    };

    Ok(Duration::from_secs(duration))
}
