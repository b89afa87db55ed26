//! Length-prefixed message codec for stream transports
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |          Frame Length (4B)        |
//! +--------+--------+--------+--------+
//! |  Header Count (2B)|
//! +--------+--------+--------+--------+
//! | Key Len (2B) | Key | Val Len (2B) | Val |  (x Header Count)
//! +--------+--------+--------+--------+
//! |               Body                |
//! +--------+--------+--------+--------+
//! ```
//!
//! Frame Length counts every byte after the length field itself.

use super::{Message, TransportError};
use crate::protocol::MAX_MESSAGE_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;

/// Size of the frame length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message into a length-prefixed frame
pub fn encode(msg: &Message) -> Result<BytesMut, TransportError> {
    let mut frame_len = 2 + msg.body.len();
    for (key, value) in &msg.header {
        if key.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(TransportError::Codec(format!("Header too large: {}", key)));
        }
        frame_len += 4 + key.len() + value.len();
    }

    if msg.header.len() > u16::MAX as usize {
        return Err(TransportError::Codec(format!(
            "Too many headers: {}",
            msg.header.len()
        )));
    }

    if frame_len > MAX_MESSAGE_SIZE {
        return Err(TransportError::Codec(format!(
            "Message too large: {} > {}",
            frame_len, MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame_len);
    buf.put_u32(frame_len as u32);
    buf.put_u16(msg.header.len() as u16);

    for (key, value) in &msg.header {
        buf.put_u16(key.len() as u16);
        buf.extend_from_slice(key.as_bytes());
        buf.put_u16(value.len() as u16);
        buf.extend_from_slice(value.as_bytes());
    }

    buf.extend_from_slice(&msg.body);

    Ok(buf)
}

/// Decode one message from the front of `buf`
///
/// Returns `Ok(None)` when `buf` does not hold a complete frame yet.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Message>, TransportError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if frame_len > MAX_MESSAGE_SIZE {
        return Err(TransportError::Codec(format!(
            "Message too large: {} > {}",
            frame_len, MAX_MESSAGE_SIZE
        )));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + frame_len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let mut frame = buf.split_to(frame_len);

    if frame.remaining() < 2 {
        return Err(TransportError::Codec("Truncated header count".to_string()));
    }
    let count = frame.get_u16() as usize;

    let mut header = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_string(&mut frame)?;
        let value = read_string(&mut frame)?;
        header.insert(key, value);
    }

    Ok(Some(Message {
        header,
        body: frame.freeze(),
    }))
}

fn read_string(frame: &mut BytesMut) -> Result<String, TransportError> {
    if frame.remaining() < 2 {
        return Err(TransportError::Codec("Truncated header".to_string()));
    }
    let len = frame.get_u16() as usize;
    if frame.remaining() < len {
        return Err(TransportError::Codec("Truncated header".to_string()));
    }
    let raw = frame.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| TransportError::Codec("Header is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let original = Message::new(&b"Hello, World!"[..])
            .with_header("Micro-Tunnel", "session")
            .with_header("Micro-Tunnel-Channel", "svc");

        let mut encoded = encode(&original).unwrap();
        let decoded = decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded, original);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let msg = Message::new(&b"partial"[..]).with_header("a", "b");
        let encoded = encode(&msg).unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_back_to_back_frames() {
        let first = Message::new(&b"one"[..]);
        let second = Message::new(&b"two"[..]).with_header("x", "y");

        let mut buf = encode(&first).unwrap();
        buf.extend_from_slice(&encode(&second).unwrap());

        assert_eq!(decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode(&mut buf).unwrap().unwrap(), second);
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        assert!(decode(&mut buf).is_err());
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u16(1);
        buf.put_u16(10);
        assert!(decode(&mut buf).is_err());
    }
}
