//! Connection-level seams of a proxy session

use async_trait::async_trait;

use super::channel::{ChannelEnd, ChannelKind};
use crate::error::Result;

/// The proxy's client connection to the destination host
#[async_trait]
pub trait UpstreamConnection: Send + Sync {
    /// Open a channel of the given kind
    async fn open_channel(&self, kind: &ChannelKind) -> Result<ChannelEnd>;

    /// Start `command` in a fresh session channel
    async fn start_command(&self, command: &str) -> Result<Box<dyn RemoteCommand>>;

    /// Close the connection; every channel on it ends
    ///
    /// Repeated calls are no-ops.
    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolve once the connection has gone away, whichever side closed it
    async fn wait_closed(&self);
}

/// A command started through [`UpstreamConnection::start_command`]
#[async_trait]
pub trait RemoteCommand: Send {
    /// Wait for the command's channel to finish, returning its exit status
    async fn wait(&mut self) -> Option<u32>;

    async fn close(&mut self);
}

/// The accepted connection from the end user
#[async_trait]
pub trait DownstreamConnection: Send + Sync {
    /// Disconnect the client; repeated calls are no-ops
    async fn close(&self);
}
