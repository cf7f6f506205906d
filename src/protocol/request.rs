//! SSH channel request payloads
//!
//! Requests are relayed as `(type, want_reply, payload)` where the payload is
//! the type-specific part of an SSH_MSG_CHANNEL_REQUEST in wire encoding
//! (RFC 4254 section 6). The SSH library exposes requests as typed calls, so
//! this module converts between the two forms.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const PTY_REQ: &str = "pty-req";
pub const ENV: &str = "env";
pub const SHELL: &str = "shell";
pub const EXEC: &str = "exec";
pub const SUBSYSTEM: &str = "subsystem";
pub const WINDOW_CHANGE: &str = "window-change";
pub const SIGNAL: &str = "signal";
pub const EXIT_STATUS: &str = "exit-status";
pub const EXIT_SIGNAL: &str = "exit-signal";
pub const XON_XOFF: &str = "xon-xoff";

/// Upper bound for a single string field inside a request payload
const MAX_FIELD_SIZE: u32 = 256 * 1024;

/// Classification of a request type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    Shell,
    Exec,
    Subsystem,
    ExitStatus,
    Other,
}

impl From<&str> for RequestKind {
    fn from(value: &str) -> Self {
        match value {
            SHELL => RequestKind::Shell,
            EXEC => RequestKind::Exec,
            SUBSYSTEM => RequestKind::Subsystem,
            EXIT_STATUS => RequestKind::ExitStatus,
            _ => RequestKind::Other,
        }
    }
}

/// A channel-scoped out-of-band request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

/// Typed view of a request payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        /// Encoded terminal modes as `(opcode, argument)` pairs
        modes: Vec<(u8, u32)>,
    },
    Env {
        name: String,
        value: String,
    },
    Shell,
    Exec {
        command: Bytes,
    },
    Subsystem {
        name: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal {
        name: String,
    },
    ExitStatus {
        code: u32,
    },
    ExitSignal {
        name: String,
        core_dumped: bool,
        message: String,
        lang: String,
    },
    XonXoff {
        client_can_do: bool,
    },
    Unknown,
}

impl ChannelRequest {
    pub fn new(request_type: impl Into<String>, want_reply: bool, payload: Bytes) -> Self {
        Self {
            request_type: request_type.into(),
            want_reply,
            payload,
        }
    }

    pub fn kind(&self) -> RequestKind {
        RequestKind::from(self.request_type.as_str())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn pty(
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(u8, u32)],
    ) -> Self {
        let mut encoded_modes = BytesMut::with_capacity(modes.len() * 5 + 1);
        for (opcode, value) in modes {
            encoded_modes.put_u8(*opcode);
            encoded_modes.put_u32(*value);
        }
        // TTY_OP_END
        encoded_modes.put_u8(0);

        let mut payload = BytesMut::new();
        put_string(&mut payload, term.as_bytes());
        payload.put_u32(col_width);
        payload.put_u32(row_height);
        payload.put_u32(pix_width);
        payload.put_u32(pix_height);
        put_string(&mut payload, &encoded_modes);
        Self::new(PTY_REQ, want_reply, payload.freeze())
    }

    pub fn env(want_reply: bool, name: &str, value: &str) -> Self {
        let mut payload = BytesMut::new();
        put_string(&mut payload, name.as_bytes());
        put_string(&mut payload, value.as_bytes());
        Self::new(ENV, want_reply, payload.freeze())
    }

    pub fn shell(want_reply: bool) -> Self {
        Self::new(SHELL, want_reply, Bytes::new())
    }

    pub fn exec(want_reply: bool, command: &[u8]) -> Self {
        let mut payload = BytesMut::new();
        put_string(&mut payload, command);
        Self::new(EXEC, want_reply, payload.freeze())
    }

    pub fn subsystem(want_reply: bool, name: &str) -> Self {
        let mut payload = BytesMut::new();
        put_string(&mut payload, name.as_bytes());
        Self::new(SUBSYSTEM, want_reply, payload.freeze())
    }

    pub fn window_change(col_width: u32, row_height: u32, pix_width: u32, pix_height: u32) -> Self {
        let mut payload = BytesMut::with_capacity(16);
        payload.put_u32(col_width);
        payload.put_u32(row_height);
        payload.put_u32(pix_width);
        payload.put_u32(pix_height);
        Self::new(WINDOW_CHANGE, false, payload.freeze())
    }

    pub fn signal(name: &str) -> Self {
        let mut payload = BytesMut::new();
        put_string(&mut payload, name.as_bytes());
        Self::new(SIGNAL, false, payload.freeze())
    }

    pub fn exit_status(code: u32) -> Self {
        Self::new(EXIT_STATUS, false, Bytes::copy_from_slice(&code.to_be_bytes()))
    }

    pub fn exit_signal(name: &str, core_dumped: bool, message: &str, lang: &str) -> Self {
        let mut payload = BytesMut::new();
        put_string(&mut payload, name.as_bytes());
        payload.put_u8(core_dumped as u8);
        put_string(&mut payload, message.as_bytes());
        put_string(&mut payload, lang.as_bytes());
        Self::new(EXIT_SIGNAL, false, payload.freeze())
    }

    pub fn xon_xoff(client_can_do: bool) -> Self {
        Self::new(XON_XOFF, false, Bytes::from(vec![client_can_do as u8]))
    }

    /// Leading length-prefixed string of the payload, lossily decoded
    ///
    /// For `exec` this is the command line, for `subsystem` the subsystem
    /// name.
    pub fn leading_string(&self) -> Result<String> {
        let mut reader = PayloadReader::new(&self.payload);
        Ok(String::from_utf8_lossy(reader.read_string()?).into_owned())
    }

    /// Decode the payload according to the request type
    pub fn decode(&self) -> Result<RequestBody> {
        let mut r = PayloadReader::new(&self.payload);
        let body = match self.request_type.as_str() {
            PTY_REQ => {
                let term = r.read_utf8()?;
                let col_width = r.read_u32()?;
                let row_height = r.read_u32()?;
                let pix_width = r.read_u32()?;
                let pix_height = r.read_u32()?;
                let modes = decode_modes(r.read_string()?);
                RequestBody::Pty {
                    term,
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                    modes,
                }
            }
            ENV => RequestBody::Env {
                name: r.read_utf8()?,
                value: r.read_utf8()?,
            },
            SHELL => RequestBody::Shell,
            EXEC => RequestBody::Exec {
                command: Bytes::copy_from_slice(r.read_string()?),
            },
            SUBSYSTEM => RequestBody::Subsystem {
                name: r.read_utf8()?,
            },
            WINDOW_CHANGE => RequestBody::WindowChange {
                col_width: r.read_u32()?,
                row_height: r.read_u32()?,
                pix_width: r.read_u32()?,
                pix_height: r.read_u32()?,
            },
            SIGNAL => RequestBody::Signal {
                name: r.read_utf8()?,
            },
            EXIT_STATUS => RequestBody::ExitStatus {
                code: r.read_u32()?,
            },
            EXIT_SIGNAL => {
                let name = r.read_utf8()?;
                let core_dumped = r.read_bool()?;
                // message and language tag are optional in practice
                let message = r.read_utf8().unwrap_or_default();
                let lang = r.read_utf8().unwrap_or_default();
                RequestBody::ExitSignal {
                    name,
                    core_dumped,
                    message,
                    lang,
                }
            }
            XON_XOFF => RequestBody::XonXoff {
                client_can_do: r.read_bool()?,
            },
            _ => RequestBody::Unknown,
        };
        Ok(body)
    }
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// Decode the pty terminal-modes blob, stopping at TTY_OP_END or at the
/// first opcode that lacks a full argument.
fn decode_modes(mut blob: &[u8]) -> Vec<(u8, u32)> {
    let mut modes = Vec::new();
    while blob.remaining() >= 5 {
        let opcode = blob.get_u8();
        if opcode == 0 || opcode >= 160 {
            break;
        }
        modes.push((opcode, blob.get_u32()));
    }
    modes
}

/// Cursor over SSH wire-encoded fields
struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_u32(&mut self) -> Result<u32> {
        if self.buf.remaining() < 4 {
            return Err(Error::InvalidMessage("Request payload truncated".to_string()));
        }
        Ok(self.buf.get_u32())
    }

    fn read_bool(&mut self) -> Result<bool> {
        if !self.buf.has_remaining() {
            return Err(Error::InvalidMessage("Request payload truncated".to_string()));
        }
        Ok(self.buf.get_u8() != 0)
    }

    fn read_string(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()?;
        if len > MAX_FIELD_SIZE {
            return Err(Error::InvalidMessage(format!(
                "Request field size {} exceeds maximum allowed {}",
                len, MAX_FIELD_SIZE
            )));
        }
        let len = len as usize;
        if self.buf.remaining() < len {
            return Err(Error::InvalidMessage("Request string truncated".to_string()));
        }
        let (value, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(value)
    }

    fn read_utf8(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.read_string()?).into_owned())
    }
}
