//! JSON-lines framing: one JSON object per `\n`-terminated line.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtocolError;

/// Default maximum encoded frame size: 1 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Encode a frame as one line, including the trailing newline.
pub fn encode_line<T: Serialize>(frame: &T, max_bytes: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(frame)?;
    if buf.len() > max_bytes {
        return Err(ProtocolError::FrameTooLarge {
            limit: max_bytes,
            actual: buf.len(),
        });
    }
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line. Surrounding whitespace is ignored.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Read the next frame.
///
/// Returns `Ok(None)` on a clean EOF. Blank lines are skipped. A line longer
/// than `max_bytes` is an error and leaves the stream unusable.
pub async fn read_frame<R, T>(reader: &mut R, max_bytes: usize) -> Result<Option<T>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let limit = (max_bytes as u64).saturating_add(1);
        let n = (&mut *reader).take(limit).read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && line.len() > max_bytes {
            return Err(ProtocolError::FrameTooLarge {
                limit: max_bytes,
                actual: line.len(),
            });
        }
        if line.trim().is_empty() {
            continue;
        }
        return decode_line(&line).map(Some);
    }
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T, max_bytes: usize) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = encode_line(frame, max_bytes)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
