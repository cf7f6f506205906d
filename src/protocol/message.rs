//! Control-plane message types
//!
//! Outbound audit events and inbound commands exchanged with the control
//! plane. Every message is one JSON object; framing lives in [`super::codec`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Proxy entry point a session came through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Way {
    /// Plain SSH client
    Terminal,
    /// Browser terminal front end
    #[serde(alias = "wetty")]
    Web,
}

impl Way {
    pub fn as_str(&self) -> &'static str {
        match self {
            Way::Terminal => "terminal",
            Way::Web => "web",
        }
    }
}

impl std::fmt::Display for Way {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation key for every audit event of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Tunnel code taken from the login name
    pub code: String,
    /// Remote address of the downstream client
    pub peer_address: String,
    /// Entry point
    pub kind: Way,
}

impl SessionIdentity {
    pub fn new(code: impl Into<String>, peer_address: impl Into<String>, kind: Way) -> Self {
        Self {
            code: code.into(),
            peer_address: peer_address.into(),
            kind,
        }
    }
}

/// Direction of an audited file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Upload,
    Download,
}

impl std::fmt::Display for FileOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOp::Upload => write!(f, "upload"),
            FileOp::Download => write!(f, "download"),
        }
    }
}

/// A file transfer detected in relayed traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub op: FileOp,
    pub filename: String,
}

impl FileEvent {
    pub fn upload(filename: impl Into<String>) -> Self {
        Self {
            op: FileOp::Upload,
            filename: filename.into(),
        }
    }

    pub fn download(filename: impl Into<String>) -> Self {
        Self {
            op: FileOp::Download,
            filename: filename.into(),
        }
    }
}

/// Message sent to the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Announcement sent once after the IPC connection is established
    AgentOnline {
        version: String,
        ssh_port: u16,
        key: String,
        hostname: String,
    },
    OpenConnect {
        code: String,
        way: Way,
        peer_ip: String,
    },
    CloseConnect {
        code: String,
        way: Way,
        peer_ip: String,
    },
    /// Shell transcript chunk, base64 encoded
    Log { code: String, way: Way, data: String },
    FileLog {
        code: String,
        way: Way,
        data: FileEvent,
    },
}

impl ControlEvent {
    pub fn open_connect(identity: &SessionIdentity) -> Self {
        ControlEvent::OpenConnect {
            code: identity.code.clone(),
            way: identity.kind,
            peer_ip: identity.peer_address.clone(),
        }
    }

    pub fn close_connect(identity: &SessionIdentity) -> Self {
        ControlEvent::CloseConnect {
            code: identity.code.clone(),
            way: identity.kind,
            peer_ip: identity.peer_address.clone(),
        }
    }

    /// Transcript event carrying exactly `chunk`
    pub fn log(identity: &SessionIdentity, chunk: &[u8]) -> Self {
        ControlEvent::Log {
            code: identity.code.clone(),
            way: identity.kind,
            data: BASE64.encode(chunk),
        }
    }

    pub fn file_log(identity: &SessionIdentity, event: FileEvent) -> Self {
        ControlEvent::FileLog {
            code: identity.code.clone(),
            way: identity.kind,
            data: event,
        }
    }

    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            ControlEvent::AgentOnline { .. } => "agent_online",
            ControlEvent::OpenConnect { .. } => "open_connect",
            ControlEvent::CloseConnect { .. } => "close_connect",
            ControlEvent::Log { .. } => "log",
            ControlEvent::FileLog { .. } => "file_log",
        }
    }

    /// Tunnel code the event belongs to, if it is session scoped
    pub fn code(&self) -> Option<&str> {
        match self {
            ControlEvent::AgentOnline { .. } => None,
            ControlEvent::OpenConnect { code, .. }
            | ControlEvent::CloseConnect { code, .. }
            | ControlEvent::Log { code, .. }
            | ControlEvent::FileLog { code, .. } => Some(code),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Command pushed by the control plane
///
/// Only `code` is required; a command without `way` targets every entry
/// point registered for the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundCommand {
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub way: Option<Way>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
}

impl InboundCommand {
    pub fn close(code: impl Into<String>, way: Option<Way>) -> Self {
        Self {
            code: code.into(),
            way,
            command_type: Some("close".to_string()),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::InvalidMessage(format!("Invalid control command: {}", e)))
    }
}
