//! Wire formats
//!
//! - Control-plane messages and their length-prefixed JSON framing
//! - SSH channel request payloads (RFC 4254 section 6)

pub mod codec;
pub mod message;
pub mod request;

pub use codec::FrameCodec;
pub use message::{ControlEvent, FileEvent, FileOp, InboundCommand, SessionIdentity, Way};
pub use request::{ChannelRequest, RequestBody, RequestKind};
