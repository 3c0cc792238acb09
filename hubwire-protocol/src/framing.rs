//! Message framing.
//!
//! Text messages are terminated by the ASCII Record Separator:
//!
//! ```text
//! +----------------+------+----------------+------+
//! | JSON message 1 | 0x1E | JSON message 2 | 0x1E | ...
//! +----------------+------+----------------+------+
//! ```
//!
//! Binary messages are preceded by their length as a base-128 varint
//! (7 bits per byte, least significant group first, high bit set on every
//! byte except the last, at most 5 bytes):
//!
//! ```text
//! +-------------+-------------------+-------------+---------
//! | len (1..=5) | payload (len)     | len (1..=5) | payload ...
//! +-------------+-------------------+-------------+---------
//! ```

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// ASCII Record Separator terminating every text message.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Maximum length of a varint length prefix in bytes.
pub const MAX_LENGTH_PREFIX_SIZE: usize = 5;

/// Largest length a 5-byte prefix may declare (2 GiB - 1).
const MAX_PREFIXED_LENGTH: u64 = i32::MAX as u64;

/// Splits the next record-separated message off the front of `buf`.
///
/// Returns the message without its separator, or `None` when no separator
/// has arrived yet (the partial message stays in `buf`).
pub fn split_record(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.iter().position(|&b| b == RECORD_SEPARATOR)?;
    let record = buf.split_to(pos).freeze();
    buf.advance(1);
    Some(record)
}

/// Appends the record separator to a serialized text message.
pub fn terminate_record(mut payload: Vec<u8>) -> Bytes {
    payload.push(RECORD_SEPARATOR);
    Bytes::from(payload)
}

/// Prepends a varint length prefix to `payload`.
///
/// Payloads longer than `max_size` are rejected.
pub fn write_length_prefixed(payload: &[u8], max_size: usize) -> Result<Bytes, ProtocolError> {
    if payload.len() > max_size {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            max: max_size,
        });
    }

    let mut buf = BytesMut::with_capacity(MAX_LENGTH_PREFIX_SIZE + payload.len());
    let mut length = payload.len();
    loop {
        let mut byte = (length & 0x7f) as u8;
        length >>= 7;
        if length > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if length == 0 {
            break;
        }
    }
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Reads a varint length prefix from the front of `buf` without consuming it.
///
/// Returns `(prefix_len, payload_len)`, or `None` if the prefix is not
/// complete yet.
pub fn read_length_prefix(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut length: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_LENGTH_PREFIX_SIZE).enumerate() {
        length |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if length > MAX_PREFIXED_LENGTH {
                return Err(ProtocolError::InvalidLengthPrefix(
                    "messages over 2GB are not supported",
                ));
            }
            return Ok(Some((i + 1, length as usize)));
        }
    }

    if buf.len() >= MAX_LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::InvalidLengthPrefix(
            "length prefix longer than 5 bytes",
        ));
    }
    Ok(None)
}

/// Splits the next length-prefixed payload off the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not hold a complete prefix and payload
/// yet; nothing is consumed in that case.
pub fn split_length_prefixed(
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Option<Bytes>, ProtocolError> {
    let (prefix_len, payload_len) = match read_length_prefix(buf)? {
        Some(parsed) => parsed,
        None => return Ok(None),
    };

    if payload_len > max_size {
        return Err(ProtocolError::MessageTooLarge {
            size: payload_len,
            max: max_size,
        });
    }

    if buf.len() < prefix_len + payload_len {
        return Ok(None);
    }

    buf.advance(prefix_len);
    Ok(Some(buf.split_to(payload_len).freeze()))
}
