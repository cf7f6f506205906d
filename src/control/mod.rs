//! Control plane boundary
//!
//! - `AuditSink`: where sessions send their audit events and register the
//!   callback that lets the control plane kill them
//! - `ControlClient`: the IPC client speaking framed JSON over a Unix socket
//! - `CallbackRegistry`: close callbacks keyed by `(code, way)`

mod client;
mod registry;

pub use client::ControlClient;
pub use registry::CallbackRegistry;

use async_trait::async_trait;
use std::sync::Arc;

use crate::protocol::{ControlEvent, Way};

/// Callback fired when the control plane asks for a session to close
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one close-callback registration
pub type RegistrationId = u64;

/// Destination of audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Deliver one event; delivery is best effort
    async fn emit(&self, event: ControlEvent);

    /// Register the close callback for a session
    ///
    /// Returns `None` when the sink keeps no callbacks.
    fn register_close(
        &self,
        _code: &str,
        _way: Way,
        _callback: CloseCallback,
    ) -> Option<RegistrationId> {
        None
    }

    /// Remove one registration without firing it
    fn deregister_close(&self, _code: &str, _way: Way, _id: RegistrationId) {}
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl AuditSink for NullSink {
    async fn emit(&self, event: ControlEvent) {
        tracing::trace!(kind = event.kind(), "Dropping audit event");
    }
}

/// Sink that forwards every event to several sinks in order
///
/// Close callbacks go to the first sink only, since a callback can fire at
/// most once.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AuditSink for FanoutSink {
    async fn emit(&self, event: ControlEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }

    fn register_close(
        &self,
        code: &str,
        way: Way,
        callback: CloseCallback,
    ) -> Option<RegistrationId> {
        self.sinks
            .first()
            .and_then(|sink| sink.register_close(code, way, callback))
    }

    fn deregister_close(&self, code: &str, way: Way, id: RegistrationId) {
        if let Some(sink) = self.sinks.first() {
            sink.deregister_close(code, way, id);
        }
    }
}
