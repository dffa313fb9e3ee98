//! Message serialization and deserialization using postcard
//!
//! Messages are serialized using postcard (compact binary format) and
//! framed with a length prefix for use over a byte stream (Unix socket,
//! pipe, in-memory duplex).
//!
//! # Frame Format
//!
//! ```text
//! [Length: u32 (big-endian)][Message bytes (postcard serialized)]
//! ```
//!
//! Maximum frame size is 1 MiB, well above the largest USB 2.0 transfer
//! the host controller schedules.

use crate::{CURRENT_VERSION, Message, ProtocolVersion, error::ProtocolError, error::Result};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed frame size (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encode a message to bytes using postcard
///
/// # Example
/// ```
/// use protocol::{Message, MessagePayload, CURRENT_VERSION, encode_message};
///
/// let msg = Message {
///     version: CURRENT_VERSION,
///     payload: MessagePayload::Ping,
/// };
/// let bytes = encode_message(&msg).unwrap();
/// assert!(!bytes.is_empty());
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(ProtocolError::from)
}

/// Decode a message from bytes using postcard
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    postcard::from_bytes(bytes).map_err(ProtocolError::from)
}

/// Validate protocol version compatibility
///
/// Compatible if major versions match; minor differences are allowed.
pub fn validate_version(message_version: &ProtocolVersion) -> Result<()> {
    if message_version.major != CURRENT_VERSION.major {
        return Err(ProtocolError::IncompatibleVersion {
            major: message_version.major,
            minor: message_version.minor,
            expected_major: CURRENT_VERSION.major,
            expected_minor: CURRENT_VERSION.minor,
        });
    }
    Ok(())
}

/// Encode a message with length prefix for framing
///
/// # Example
/// ```
/// use protocol::{Message, MessagePayload, CURRENT_VERSION, encode_framed};
///
/// let msg = Message {
///     version: CURRENT_VERSION,
///     payload: MessagePayload::Ping,
/// };
/// let framed = encode_framed(&msg).unwrap();
/// assert!(framed.len() >= 4); // At least length prefix
/// ```
pub fn encode_framed(message: &Message) -> Result<Vec<u8>> {
    let message_bytes = encode_message(message)?;
    let message_len = message_bytes.len();

    if message_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: message_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + message_len);
    frame.extend_from_slice(&(message_len as u32).to_be_bytes());
    frame.extend_from_slice(&message_bytes);

    Ok(frame)
}

/// Async: encode and write a framed message, then flush
#[cfg(feature = "async")]
pub async fn write_message_async<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWriteExt + Unpin + ?Sized,
{
    let framed = encode_framed(message)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: read one framed message and decode it
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix.
#[cfg(feature = "async")]
pub async fn read_message_async<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncReadExt + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_be_bytes(len_bytes) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes).await?;

    decode_message(&message_bytes).map(Some)
}
