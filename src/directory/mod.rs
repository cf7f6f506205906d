//! Tunnel directory
//!
//! Login names have the shape `<code>_<remote user>`. The code is resolved
//! by the directory service to the destination host and port.

mod client;

pub use client::DirectoryClient;

use crate::error::{Error, Result};

/// Login name split into its tunnel code and remote user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelLogin {
    pub code: String,
    pub user: String,
}

/// Resolved upstream destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub code: String,
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl Destination {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Split a login name at the first `_`
///
/// Everything after the first separator is the remote user, so
/// `abc_deploy_bot` maps to code `abc` and user `deploy_bot`.
pub fn parse_username(username: &str) -> Result<TunnelLogin> {
    let parts: Vec<&str> = username.split('_').collect();
    if parts.len() < 2 {
        return Err(Error::UserNotFound(username.to_string()));
    }

    Ok(TunnelLogin {
        code: parts[0].to_string(),
        user: parts[1..].join("_"),
    })
}
