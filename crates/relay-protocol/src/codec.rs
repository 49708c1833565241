//! Length-prefixed framing.
//!
//! Stream transports carry each unit (a request envelope, a reply envelope or
//! a subscriber [`Frame`]) as:
//! - 4 bytes: Big-endian length prefix
//! - N bytes: MessagePack payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Append a length-prefixed payload to a buffer.
///
/// # Errors
///
/// Returns an error if the payload is larger than [`MAX_FRAME_SIZE`].
pub fn write_prefixed(payload: &[u8], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);

    Ok(())
}

/// Length-prefix a payload.
///
/// # Errors
///
/// Returns an error if the payload is larger than [`MAX_FRAME_SIZE`].
pub fn prefixed(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    write_prefixed(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Try to split one length-prefixed payload off the front of a buffer.
///
/// Returns `Ok(Some(payload))` if a complete unit was available,
/// `Ok(None)` if more data is needed.
///
/// # Errors
///
/// Returns an error if the announced length exceeds `max_size`.
pub fn split_prefixed(buf: &mut BytesMut, max_size: usize) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > max_size.min(MAX_FRAME_SIZE) {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        buf.reserve(total_size - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(buf.split_to(length).freeze()))
}

/// Encode a subscriber frame to bytes.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;
    prefixed(&payload)
}

/// Decode a subscriber frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Try to decode a subscriber frame from a buffer, advancing it if successful.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    match split_prefixed(buf, MAX_FRAME_SIZE)? {
        Some(payload) => Ok(Some(rmp_serde::from_slice(&payload)?)),
        None => Ok(None),
    }
}
