//! Error types for ssh-audit-proxy

use thiserror::Error;

/// Main error type for ssh-audit-proxy
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Listen error: {0}")]
    Listen(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH key error: {0}")]
    Key(#[from] russh::keys::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Login name does not carry a tunnel code
    #[error("User does not exist: {0}")]
    UserNotFound(String),

    /// Directory service could not resolve the tunnel code
    #[error("Lookup failed: {0}")]
    Lookup(String),

    #[error("Upstream dial failed: {0}")]
    UpstreamDial(String),

    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    /// Audited sub-protocol bytes could not be decoded
    #[error("Inspect error: {0}")]
    Inspect(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error came from resolving the login name to a destination
    pub fn is_lookup(&self) -> bool {
        matches!(self, Error::UserNotFound(_) | Error::Lookup(_) | Error::Http(_))
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
