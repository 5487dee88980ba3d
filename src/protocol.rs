use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame flags
pub const FLAG_SYN: u8 = 0x01; // First frame of a stream, may carry data
pub const FLAG_DATA: u8 = 0x02; // Payload data
pub const FLAG_FIN: u8 = 0x03; // Close stream, no payload
pub const FLAG_WINDOW_UPDATE: u8 = 0x04; // Return receive credit to the sender

/// Default per-stream flow control window (256 KB)
pub const DEFAULT_WINDOW_SIZE: usize = 256 * 1024;

/// Maximum payload per frame
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Frame header size (flag + stream_id + length)
pub const HEADER_SIZE: usize = 7;

/// Payload size of a WINDOW_UPDATE frame
const WINDOW_UPDATE_SIZE: usize = 4;

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    Syn = FLAG_SYN,
    Data = FLAG_DATA,
    Fin = FLAG_FIN,
    WindowUpdate = FLAG_WINDOW_UPDATE,
}

impl TryFrom<u8> for Flag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            FLAG_SYN => Ok(Flag::Syn),
            FLAG_DATA => Ok(Flag::Data),
            FLAG_FIN => Ok(Flag::Fin),
            FLAG_WINDOW_UPDATE => Ok(Flag::WindowUpdate),
            other => Err(Error::MalformedFrame(format!("unknown flag 0x{:02x}", other))),
        }
    }
}

/// Wire unit
///
/// Wire format:
/// ```text
/// [flag: u8][stream_id: u32][length: u16][payload: length bytes]
/// ```
/// All integers are big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub flag: Flag,

    /// Stream identifier
    pub stream_id: u32,

    /// Payload, at most [`MAX_PAYLOAD_SIZE`] bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(flag: Flag, stream_id: u32, payload: Bytes) -> Self {
        Self {
            flag,
            stream_id,
            payload,
        }
    }

    /// Create a SYN frame carrying the first chunk of a stream
    pub fn syn(stream_id: u32, payload: Bytes) -> Self {
        Self::new(Flag::Syn, stream_id, payload)
    }

    /// Create a data frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self::new(Flag::Data, stream_id, payload)
    }

    /// Create a FIN frame to close a stream
    pub fn fin(stream_id: u32) -> Self {
        Self::new(Flag::Fin, stream_id, Bytes::new())
    }

    /// Create a WINDOW_UPDATE frame granting `credit` more bytes
    pub fn window_update(stream_id: u32, credit: u32) -> Self {
        Self::new(
            Flag::WindowUpdate,
            stream_id,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    /// Credit carried by a WINDOW_UPDATE frame
    pub fn credit(&self) -> Option<u32> {
        if self.flag != Flag::WindowUpdate {
            return None;
        }
        let raw: [u8; WINDOW_UPDATE_SIZE] = self.payload[..].try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    /// Encoded size on the wire
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(Error::FrameTooLarge(len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + len);
        buf.put_u8(self.flag as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(len as u16);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns the frame and the number of bytes it occupied. Trailing bytes
    /// after the frame are left for the caller.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::MalformedFrame(format!(
                "truncated header: {} bytes (expected at least {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        let (flag, stream_id, len) = parse_header(&buf[..HEADER_SIZE])?;

        let remaining = buf.len() - HEADER_SIZE;
        if len > remaining {
            return Err(Error::MalformedFrame(format!(
                "length field says {} bytes, but only {} bytes remain",
                len, remaining
            )));
        }

        let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..HEADER_SIZE + len]);
        Ok((Self::new(flag, stream_id, payload), HEADER_SIZE + len))
    }
}

/// Parse and validate a 7-byte header into (flag, stream_id, length).
fn parse_header(header: &[u8]) -> Result<(Flag, u32, usize)> {
    let flag = Flag::try_from(header[0])?;
    let stream_id = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let len = u16::from_be_bytes([header[5], header[6]]) as usize;

    match flag {
        Flag::Fin if len != 0 => Err(Error::MalformedFrame(format!(
            "FIN for stream {} carries {} bytes",
            stream_id, len
        ))),
        Flag::WindowUpdate if len != WINDOW_UPDATE_SIZE => Err(Error::MalformedFrame(format!(
            "WINDOW_UPDATE for stream {} has {} byte payload",
            stream_id, len
        ))),
        _ => Ok((flag, stream_id, len)),
    }
}

/// Read exactly one frame from a byte stream.
///
/// Returns `Ok(None)` if the stream ends cleanly on a frame boundary. End of
/// stream anywhere inside a frame is a [`Error::MalformedFrame`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];

    // A zero-length read before the first header byte is a clean EOF.
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .map_err(|e| truncated(e, "header"))?;

    let (flag, stream_id, len) = parse_header(&header)?;

    let mut payload = BytesMut::zeroed(len);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| truncated(e, "payload"))?;

    Ok(Some(Frame::new(flag, stream_id, payload.freeze())))
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn truncated(err: io::Error, part: &str) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::MalformedFrame(format!("connection ended inside frame {}", part))
    } else {
        Error::Io(err)
    }
}
