//! Length-prefixed frame codec.
//!
//! Wire format of one frame:
//! ```text
//! [payload_len:4][payload:N]
//! ```
//! `payload_len` is a big-endian `u32`.  The payload is a `bincode`-encoded
//! message from [`crate::protocol::messages`].
//!
//! Frames larger than [`MAX_FRAME_SIZE`] are refused on both ends so a
//! corrupt or hostile length prefix cannot make a reader allocate gigabytes.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest payload accepted in a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors that can occur while framing or (de)serialising messages.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the frame it announces.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The length prefix exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    /// The payload could not be decoded into the expected message type.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

// ── Message payloads ──────────────────────────────────────────────────────────

/// Serialises `msg` into a frame payload.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if `bincode` rejects the value.
///
/// # Examples
///
/// ```rust
/// use tabletop_core::protocol::{decode_message, encode_message, ClientMessage};
///
/// let bytes = encode_message(&ClientMessage::Heartbeat).unwrap();
/// let decoded: ClientMessage = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, ClientMessage::Heartbeat);
/// ```
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(msg).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Deserialises a frame payload into `T`.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the bytes do not describe a `T`.
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(payload).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Prepends the 4-byte length prefix to `payload`.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] when the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    check_size(payload.len())?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Splits one frame off the start of `bytes`.
///
/// Returns the payload and the total number of bytes consumed (prefix +
/// payload), so the caller can advance its read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if the frame is incomplete and
/// [`ProtocolError::FrameTooLarge`] if the prefix is over the limit.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), ProtocolError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_HEADER_SIZE,
            available: bytes.len(),
        });
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    check_size(len)?;
    let total = FRAME_HEADER_SIZE + len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }
    Ok((&bytes[FRAME_HEADER_SIZE..total], total))
}

/// Writes one frame to a blocking writer and flushes it.
///
/// # Errors
///
/// Propagates I/O errors; an oversized payload is reported as
/// [`io::ErrorKind::InvalidData`].
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    check_size(payload.len())?;
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Reads exactly one frame from a blocking reader and returns its payload.
///
/// # Errors
///
/// Propagates I/O errors (including read timeouts and
/// [`io::ErrorKind::UnexpectedEof`] when the peer closes mid-frame); an
/// oversized length prefix is reported as [`io::ErrorKind::InvalidData`].
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    check_size(len)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ClientMessage, ServerMessage};
    use std::io::Cursor;

    #[test]
    fn test_encode_frame_prefixes_big_endian_length() {
        // Act
        let frame = encode_frame(&[0xAA, 0xBB, 0xCC]).expect("encode");

        // Assert
        assert_eq!(frame, vec![0, 0, 0, 3, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_decode_frame_returns_payload_and_consumed_length() {
        // Arrange: one complete frame followed by the start of another.
        let mut bytes = encode_frame(b"hello").expect("encode");
        bytes.extend_from_slice(&[0, 0]);

        // Act
        let (payload, consumed) = decode_frame(&bytes).expect("decode");

        // Assert
        assert_eq!(payload, b"hello");
        assert_eq!(consumed, 9);
    }

    #[test]
    fn test_decode_frame_short_header_is_insufficient_data() {
        assert_eq!(
            decode_frame(&[0, 0]),
            Err(ProtocolError::InsufficientData {
                needed: 4,
                available: 2
            })
        );
    }

    #[test]
    fn test_decode_frame_truncated_payload_is_insufficient_data() {
        let bytes = [0, 0, 0, 10, 1, 2, 3];
        assert_eq!(
            decode_frame(&bytes),
            Err(ProtocolError::InsufficientData {
                needed: 14,
                available: 7
            })
        );
    }

    #[test]
    fn test_decode_frame_rejects_oversized_prefix() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF];
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_write_then_read_frame_over_a_stream() {
        // Arrange
        let mut wire = Vec::new();
        write_frame(&mut wire, b"first").expect("write");
        write_frame(&mut wire, b"").expect("write");
        let mut reader = Cursor::new(wire);

        // Act / Assert
        assert_eq!(read_frame(&mut reader).expect("read"), b"first");
        assert_eq!(read_frame(&mut reader).expect("read"), b"");
        let eof = read_frame(&mut reader).expect_err("stream is exhausted");
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_decode_message_rejects_wrong_type() {
        // A ServerMessage payload is not a valid ClientMessage variant index.
        let payload =
            encode_message(&ServerMessage::Booted { reason: "x".into() }).expect("encode");
        let result: Result<ClientMessage, _> = decode_message(&payload);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }
}
