//! Protocol inspector
//!
//! Watches the bytes a client sends on one channel and raises file-transfer
//! events for SFTP and SCP. Detection is best effort: a buffer that cannot be
//! decoded is skipped and relayed untouched.

pub mod scp;
pub mod sftp;

use tracing::{debug, trace};

use crate::protocol::{FileEvent, RequestKind};
use crate::proxy::context::RequestContext;

pub use sftp::SftpRequest;

/// SCP transfer direction recorded for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScpDirection {
    #[default]
    Unknown,
    Upload,
    Download,
}

/// Per-channel inspector state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectorState {
    /// Filename of the last SFTP OPEN not yet consumed by READ/WRITE/CLOSE
    pub pending_filename: Option<String>,
    pub scp_direction: ScpDirection,
    /// SCP classification is attempted on the first data chunk only
    pub scp_filename_captured: bool,
}

/// Stateful classifier for the client-to-server direction of one channel
#[derive(Debug, Default)]
pub struct Inspector {
    state: InspectorState,
}

impl Inspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &InspectorState {
        &self.state
    }

    /// Inspect one chunk read from the client under the given context
    pub fn inspect(&mut self, ctx: &RequestContext, chunk: &[u8]) -> Option<FileEvent> {
        if ctx.is_sftp() {
            return self.inspect_sftp(chunk);
        }
        if ctx.request_type == RequestKind::Exec && !ctx.command.is_empty() {
            return self.inspect_scp(&ctx.command, chunk);
        }
        None
    }

    fn inspect_sftp(&mut self, chunk: &[u8]) -> Option<FileEvent> {
        let request = match SftpRequest::parse(chunk) {
            Ok(request) => request,
            Err(e) => {
                trace!(error = %e, "Skipping SFTP classification");
                return None;
            }
        };

        match request {
            SftpRequest::Open { filename } => {
                trace!(filename = %filename, "SFTP open");
                self.state.pending_filename = Some(filename);
                None
            }
            SftpRequest::Close => {
                self.state.pending_filename = None;
                None
            }
            SftpRequest::Read => self.state.pending_filename.take().map(FileEvent::download),
            SftpRequest::Write => self.state.pending_filename.take().map(FileEvent::upload),
            SftpRequest::Other(_) => None,
        }
    }

    fn inspect_scp(&mut self, command: &str, chunk: &[u8]) -> Option<FileEvent> {
        if self.state.scp_filename_captured {
            return None;
        }
        self.state.scp_filename_captured = true;

        match scp::classify(command, chunk) {
            Ok(event) => {
                self.state.scp_direction = match event.op {
                    crate::protocol::FileOp::Upload => ScpDirection::Upload,
                    crate::protocol::FileOp::Download => ScpDirection::Download,
                };
                Some(event)
            }
            Err(e) => {
                debug!(error = %e, "Skipping SCP classification");
                None
            }
        }
    }
}
