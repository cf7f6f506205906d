//! SSH proxy core
//!
//! This module provides:
//! - `ProxyServer`: TCP listener running the russh server side
//! - `ProxyHandler`: per-connection russh handler holding the login result
//! - `ProxySession`: pairs downstream and upstream channels for one login
//! - `ChannelRelay`: request relay and data pumps of one channel pair
//! - `UpstreamDialer`: russh client dialing the resolved destination
//! - `SessionHooks`: authentication and lifecycle hooks
//! - `memory`: in-memory channels and connections (tests and the
//!   `test-util` feature)

pub mod channel;
pub mod completion;
pub mod connection;
pub mod context;
pub mod downstream;
pub mod handler;
pub mod hooks;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod relay;
pub mod server;
pub mod session;
pub mod upstream;

pub use channel::{ChannelEnd, ChannelEvent, ChannelKind, IncomingChannel};
pub use completion::CompletionLatch;
pub use connection::{DownstreamConnection, RemoteCommand, UpstreamConnection};
pub use context::RequestContext;
pub use handler::ProxyHandler;
pub use hooks::{Authenticated, ConnectionMeta, DirectoryHooks, SessionHooks};
pub use relay::ChannelRelay;
pub use server::{ProxyServer, load_host_key, server_config};
pub use session::{ProxySession, SessionDrain, SessionTracker};
pub use upstream::{SshUpstream, UpstreamDialer};
