//! ssh-audit-proxy - intercepting SSH proxy with audit events
//!
//! This library terminates SSH logins of the form `<code>_<user>`, resolves
//! the tunnel code through a directory service, opens a second SSH
//! connection to the destination and relays channels between the two legs.
//! While relaying it reports connects, disconnects, shell transcripts and
//! SFTP/SCP file transfers to a control plane.

pub mod cli;
pub mod config;
pub mod control;
pub mod directory;
pub mod error;
pub mod inspect;
pub mod logging;
pub mod protocol;
pub mod proxy;

pub use error::{Error, Result};

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name
pub const NAME: &str = env!("CARGO_PKG_NAME");
