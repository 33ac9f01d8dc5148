//! Frame codec for the stdio link between a host and a worker process.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬───────────┬────────────────────────┐
//! │ len (4B) │ tag (1B) │ port (4B) │   JSON payload         │
//! │ u32 BE   │ u8       │ u32 BE    │                        │
//! └──────────┴──────────┴───────────┴────────────────────────┘
//! ```
//! Length = tag byte + port number + payload, NOT including the 4-byte prefix.
//! Port 0 is the primary link; other numbers name transferred channels.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Tag: envelope traffic (`ServiceMessage`).
pub const TAG_SERVICE_MESSAGE: u8 = 0x01;
/// Tag: channel hand-off (`ServiceNewClient`), payload `{clientId}`.
pub const TAG_NEW_CLIENT: u8 = 0x02;
/// Tag: a transferred channel was closed. Empty payload.
pub const TAG_CLOSE_PORT: u8 = 0x03;

/// Port number of the primary host/worker link.
pub const PRIMARY_PORT: u32 = 0;

const HEADER_LEN: u32 = 1 + 4;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub tag: u8,
    pub port: u32,
    pub payload: Vec<u8>,
}

impl WireFrame {
    pub fn new(tag: u8, port: u32, payload: Vec<u8>) -> Self {
        Self { tag, port, payload }
    }

    pub fn close_port(port: u32) -> Self {
        Self::new(TAG_CLOSE_PORT, port, Vec::new())
    }

    /// Size on the wire after the length prefix.
    pub fn body_len(&self) -> usize {
        HEADER_LEN as usize + self.payload.len()
    }
}

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF. `max_frame_bytes` caps the accepted length.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<WireFrame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < HEADER_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too short: {} bytes, header needs {}", frame_len, HEADER_LEN),
        ));
    }

    let mut frame_data = vec![0u8; frame_len as usize];
    reader.read_exact(&mut frame_data).await?;

    let tag = frame_data[0];
    let port = u32::from_be_bytes([frame_data[1], frame_data[2], frame_data[3], frame_data[4]]);
    frame_data.drain(..HEADER_LEN as usize);

    Ok(Some(WireFrame {
        tag,
        port,
        payload: frame_data,
    }))
}

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    frame: &WireFrame,
    max_frame_bytes: u32,
) -> std::io::Result<()> {
    let frame_len = u32::try_from(frame.body_len())
        .ok()
        .filter(|len| *len <= max_frame_bytes)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Frame too large: {} bytes", frame.body_len()),
            )
        })?;

    writer.write_all(&frame_len.to_be_bytes()).await?;
    writer.write_all(&[frame.tag]).await?;
    writer.write_all(&frame.port.to_be_bytes()).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}
