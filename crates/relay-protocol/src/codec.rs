//! Codec for the newline-delimited JSON stream.
//!
//! Each message is one JSON object followed by a single `\n`. Decoding is
//! tolerant of blank lines between objects.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::wire::WireMessage;

/// Maximum encoded line size (16 MiB).
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Line terminator.
pub const DELIMITER: u8 = b'\n';

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Line exceeds maximum size.
    #[error("Line size {0} exceeds maximum {MAX_LINE_SIZE}")]
    LineTooLarge(usize),

    /// No terminated line in the input.
    #[error("Incomplete line: {0} bytes without a terminator")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message as one terminated line.
///
/// # Errors
///
/// Returns an error if the line is too large or serialization fails.
pub fn encode(msg: &WireMessage) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message into an existing buffer.
///
/// # Errors
///
/// Returns an error if the line is too large or serialization fails.
pub fn encode_into(msg: &WireMessage, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let line = serde_json::to_vec(msg)?;

    if line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLarge(line.len()));
    }

    buf.reserve(line.len() + 1);
    buf.extend_from_slice(&line);
    buf.put_u8(DELIMITER);

    Ok(())
}

/// Decode a single line.
///
/// A trailing terminator is optional.
///
/// # Errors
///
/// Returns an error if the line is too large or is not a valid message.
pub fn decode(data: &[u8]) -> Result<WireMessage, ProtocolError> {
    let line = data.strip_suffix(&[DELIMITER]).unwrap_or(data);

    if line.len() > MAX_LINE_SIZE {
        return Err(ProtocolError::LineTooLarge(line.len()));
    }

    Ok(serde_json::from_slice(line)?)
}

/// Try to decode a message from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(msg))` if a complete line was decoded, `Ok(None)` if more
/// data is needed, or `Err` on protocol error. Blank lines are consumed and
/// skipped.
///
/// # Errors
///
/// Returns an error if a line is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<WireMessage>, ProtocolError> {
    loop {
        let Some(pos) = buf.iter().position(|b| *b == DELIMITER) else {
            if buf.len() > MAX_LINE_SIZE {
                return Err(ProtocolError::LineTooLarge(buf.len()));
            }
            return Ok(None);
        };

        let line = buf.split_to(pos);
        buf.advance(1);

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return decode(&line).map(Some);
    }
}

/// Decode a buffer that must hold exactly one complete line.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if no terminator is present.
pub fn decode_line(data: &[u8]) -> Result<WireMessage, ProtocolError> {
    if !data.ends_with(&[DELIMITER]) {
        return Err(ProtocolError::Incomplete(data.len()));
    }
    decode(data)
}
