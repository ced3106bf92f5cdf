//! Length-prefixed framing for the command stream
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! UTF-8. One command (or one result) per frame; boundaries are never merged.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("connection closed mid-frame")]
    Truncated,
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub async fn write_frame<W>(writer: &mut W, text: &str) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = text.len();
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_u32(len as u32).await?;
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame; `Ok(None)` means the peer closed cleanly between frames
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 { Ok(None) } else { Err(FrameError::Truncated) };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(FrameError::Truncated),
        Err(e) => return Err(e.into()),
    }
    String::from_utf8(payload).map(Some).map_err(|_| FrameError::InvalidUtf8)
}
