//! Length-prefixed JSON framing for the control-plane socket

use crate::error::{Error, Result};
use crate::protocol::message::{ControlEvent, InboundCommand};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size (1 MiB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Codec for reading and writing control-plane frames
///
/// A frame is a 4-byte big-endian body length followed by a JSON body.
pub struct FrameCodec;

impl FrameCodec {
    /// Read one frame body, or `None` on clean EOF
    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf);
        if len == 0 {
            return Err(Error::InvalidMessage("Zero-length frame".to_string()));
        }
        if len > MAX_FRAME_SIZE {
            return Err(Error::InvalidMessage(format!(
                "Frame too large: {} bytes",
                len
            )));
        }

        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    /// Write one frame body
    pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
        let len = u32::try_from(body.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_SIZE)
            .ok_or_else(|| {
                Error::InvalidMessage(format!("Frame too large: {} bytes", body.len()))
            })?;

        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(body).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write an outbound event
    pub async fn write_event<W: AsyncWrite + Unpin>(
        writer: &mut W,
        event: &ControlEvent,
    ) -> Result<()> {
        Self::write_frame(writer, &event.to_json()?).await
    }

    /// Read an inbound command, or `None` on clean EOF
    pub async fn read_command<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Option<InboundCommand>> {
        match Self::read_frame(reader).await? {
            Some(body) => InboundCommand::decode(&body).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{SessionIdentity, Way};

    #[tokio::test]
    async fn test_event_frame_layout() {
        let identity = SessionIdentity::new("abc123", "127.0.0.1:4000", Way::Terminal);
        let event = ControlEvent::open_connect(&identity);

        let mut out = Vec::new();
        FrameCodec::write_event(&mut out, &event).await.unwrap();

        let body = event.to_json().unwrap();
        assert_eq!(&out[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&out[4..], &body[..]);
    }

    #[tokio::test]
    async fn test_read_command_then_eof() {
        let body = br#"{"code":"abc123","way":"terminal"}"#;
        let mut input = Vec::new();
        input.extend_from_slice(&(body.len() as u32).to_be_bytes());
        input.extend_from_slice(body);

        let mut reader = &input[..];
        let cmd = FrameCodec::read_command(&mut reader).await.unwrap().unwrap();
        assert_eq!(cmd.code, "abc123");
        assert_eq!(cmd.way, Some(Way::Terminal));

        assert!(FrameCodec::read_command(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let input = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut reader = &input[..];
        let err = FrameCodec::read_frame(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_rejects_zero_length_frame() {
        let input = 0u32.to_be_bytes();
        let mut reader = &input[..];
        assert!(FrameCodec::read_frame(&mut reader).await.is_err());
    }
}
