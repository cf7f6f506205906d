//! Minimal SFTP client-request decoding
//!
//! Only the fields needed for file-transfer auditing are read, at fixed
//! offsets from the start of a read buffer:
//!
//! ```text
//! uint32  length
//! byte    type        <- offset 4
//! uint32  request-id
//! string  filename    <- length at offset 9, bytes from offset 13 (OPEN only)
//! ```
//!
//! One request is assumed per buffer. Requests that straddle buffers are not
//! reassembled.

use bytes::Buf;

use crate::error::{Error, Result};

pub const SSH_FXP_OPEN: u8 = 3;
pub const SSH_FXP_CLOSE: u8 = 4;
pub const SSH_FXP_READ: u8 = 5;
pub const SSH_FXP_WRITE: u8 = 6;

const TYPE_OFFSET: usize = 4;
const FILENAME_LEN_OFFSET: usize = 9;
const FILENAME_OFFSET: usize = 13;

/// Client request relevant to auditing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpRequest {
    Open { filename: String },
    Close,
    Read,
    Write,
    Other(u8),
}

impl SftpRequest {
    /// Decode the request header at the start of `buf`
    ///
    /// An OPEN whose declared filename length runs past the buffer yields the
    /// bytes that are present.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let Some(&opcode) = buf.get(TYPE_OFFSET) else {
            return Err(Error::Inspect(format!(
                "SFTP packet too short: {} bytes",
                buf.len()
            )));
        };

        let request = match opcode {
            SSH_FXP_OPEN => {
                if buf.len() < FILENAME_OFFSET {
                    return Err(Error::Inspect("SFTP OPEN header truncated".to_string()));
                }
                let declared = (&buf[FILENAME_LEN_OFFSET..FILENAME_OFFSET]).get_u32() as usize;
                let end = FILENAME_OFFSET.saturating_add(declared).min(buf.len());
                SftpRequest::Open {
                    filename: String::from_utf8_lossy(&buf[FILENAME_OFFSET..end]).into_owned(),
                }
            }
            SSH_FXP_CLOSE => SftpRequest::Close,
            SSH_FXP_READ => SftpRequest::Read,
            SSH_FXP_WRITE => SftpRequest::Write,
            other => SftpRequest::Other(other),
        };
        Ok(request)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    /// Build an SFTP OPEN request as an SFTP client writes it
    pub(crate) fn open_packet(request_id: u32, filename: &str) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u8(SSH_FXP_OPEN);
        body.put_u32(request_id);
        body.put_u32(filename.len() as u32);
        body.put_slice(filename.as_bytes());
        body.put_u32(0x01); // SSH_FXF_READ
        body.put_u32(0); // empty attrs

        let mut packet = BytesMut::new();
        packet.put_u32(body.len() as u32);
        packet.put_slice(&body);
        packet.to_vec()
    }

    /// Build a request with only a handle argument (READ/WRITE/CLOSE)
    pub(crate) fn handle_packet(opcode: u8, request_id: u32) -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u8(opcode);
        body.put_u32(request_id);
        body.put_u32(4);
        body.put_slice(b"\x00\x00\x00\x01");
        body.put_u64(0);
        body.put_u32(32768);

        let mut packet = BytesMut::new();
        packet.put_u32(body.len() as u32);
        packet.put_slice(&body);
        packet.to_vec()
    }

    #[test]
    fn test_parse_open() {
        let packet = open_packet(3, "report.csv");
        assert_eq!(
            SftpRequest::parse(&packet).unwrap(),
            SftpRequest::Open {
                filename: "report.csv".to_string()
            }
        );
    }

    #[test]
    fn test_parse_handle_requests() {
        assert_eq!(
            SftpRequest::parse(&handle_packet(SSH_FXP_READ, 4)).unwrap(),
            SftpRequest::Read
        );
        assert_eq!(
            SftpRequest::parse(&handle_packet(SSH_FXP_WRITE, 5)).unwrap(),
            SftpRequest::Write
        );
        assert_eq!(
            SftpRequest::parse(&handle_packet(SSH_FXP_CLOSE, 6)).unwrap(),
            SftpRequest::Close
        );
    }

    #[test]
    fn test_parse_other_opcode() {
        // SSH_FXP_INIT
        let packet = [0, 0, 0, 5, 1, 0, 0, 0, 3];
        assert_eq!(SftpRequest::parse(&packet).unwrap(), SftpRequest::Other(1));
    }

    #[test]
    fn test_open_filename_clamped_to_buffer() {
        let mut packet = open_packet(1, "a-very-long-file-name.tar.gz");
        packet.truncate(FILENAME_OFFSET + 6);
        assert_eq!(
            SftpRequest::parse(&packet).unwrap(),
            SftpRequest::Open {
                filename: "a-very".to_string()
            }
        );
    }

    #[test]
    fn test_short_buffers_are_errors() {
        assert!(matches!(SftpRequest::parse(&[0, 0, 0]), Err(Error::Inspect(_))));
        assert!(matches!(
            SftpRequest::parse(&[0, 0, 0, 9, SSH_FXP_OPEN, 0, 0, 0, 1, 0]),
            Err(Error::Inspect(_))
        ));
    }
}
