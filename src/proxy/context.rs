//! Per-channel request classification shared with the data pumps
//!
//! The request relay is the only writer. Pumps read snapshots through a
//! `tokio::sync::watch` receiver, so a pump never observes a half-updated
//! context.

use tokio::sync::watch;

use crate::protocol::{ChannelRequest, RequestKind};

/// Classification state of one channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Type of the most recent request seen in either direction
    pub request_type: RequestKind,
    /// Name from the last `subsystem` request
    pub subsystem_name: String,
    /// Command line from the last `exec` request
    pub command: String,
}

impl RequestContext {
    /// Fold a relayed request into the context
    ///
    /// Every request replaces `request_type`, so a `window-change` on a
    /// shell channel ends shell mode for the rest of the channel.
    pub fn observe(&mut self, request: &ChannelRequest) {
        self.request_type = request.kind();
        match self.request_type {
            RequestKind::Subsystem => {
                self.subsystem_name = request.leading_string().unwrap_or_else(|e| {
                    tracing::debug!(error = %e, "Unreadable subsystem name");
                    String::new()
                });
            }
            RequestKind::Exec => {
                self.command = request.leading_string().unwrap_or_else(|e| {
                    tracing::debug!(error = %e, "Unreadable exec command");
                    String::new()
                });
            }
            _ => {}
        }
    }

    pub fn is_sftp(&self) -> bool {
        self.request_type == RequestKind::Subsystem && self.subsystem_name == "sftp"
    }
}

pub type ContextPublisher = watch::Sender<RequestContext>;
pub type ContextReader = watch::Receiver<RequestContext>;

/// Create the publisher/reader pair for a new channel
pub fn channel() -> (ContextPublisher, ContextReader) {
    watch::channel(RequestContext::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_shell() {
        let ctx = RequestContext::default();
        assert_eq!(ctx.request_type, RequestKind::Shell);
        assert!(!ctx.is_sftp());
    }

    #[test]
    fn test_subsystem_sets_name() {
        let mut ctx = RequestContext::default();
        ctx.observe(&ChannelRequest::subsystem(true, "sftp"));
        assert_eq!(ctx.request_type, RequestKind::Subsystem);
        assert_eq!(ctx.subsystem_name, "sftp");
        assert!(ctx.is_sftp());
    }

    #[test]
    fn test_every_request_updates_type() {
        let mut ctx = RequestContext::default();
        ctx.observe(&ChannelRequest::pty(true, "xterm", 80, 24, 0, 0, &[]));
        assert_eq!(ctx.request_type, RequestKind::Other);
        ctx.observe(&ChannelRequest::shell(true));
        assert_eq!(ctx.request_type, RequestKind::Shell);
        ctx.observe(&ChannelRequest::exec(true, b"scp -f /etc/hosts"));
        assert_eq!(ctx.request_type, RequestKind::Exec);
        assert_eq!(ctx.command, "scp -f /etc/hosts");
        ctx.observe(&ChannelRequest::exit_status(0));
        assert_eq!(ctx.request_type, RequestKind::ExitStatus);
    }

    #[tokio::test]
    async fn test_readers_see_published_snapshot() {
        let (publisher, reader) = channel();
        publisher.send_modify(|ctx| ctx.observe(&ChannelRequest::subsystem(true, "sftp")));
        assert!(reader.borrow().is_sftp());
    }
}
