//! Length-Prefixed Frame Parser
//!
//! This module implements the framing layer of the game protocol. Every frame
//! starts with a 2-byte little-endian length field followed by the payload.
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────────┬───────────────────────────────┐
//! │ length (u16) │ payload (length - 2 bytes)    │
//! │ little-endian│                               │
//! └──────────────┴───────────────────────────────┘
//! ```
//!
//! The length field counts itself, so a frame carrying `HELLO` is encoded as
//! `[0x07, 0x00, b'H', b'E', b'L', b'L', b'O']`.
//!
//! Two declared lengths are special:
//! - `1` is a sentinel for a zero-length payload (the frame is just the header)
//! - `0` can never describe a frame and is rejected as malformed
//!
//! ## How the Parser Works
//!
//! Like the rest of the crate's incremental parsers, parsing returns:
//! - `Ok(Some(..))` - a complete frame is buffered
//! - `Ok(None)` - need more data, the frame is incomplete
//! - `Err(FrameError)` - the stream is malformed and the connection must go
//!
//! A frame that claims more bytes than the connection's read buffer can ever
//! hold is rejected up front instead of waiting forever for the missing bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the length field that prefixes every frame.
pub const HEADER_LEN: usize = 2;

/// Declared length meaning "header only, empty payload".
pub const EMPTY_FRAME_SENTINEL: u16 = 1;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - HEADER_LEN;

/// Errors that can occur while framing or unframing data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The length field holds a value that cannot describe a frame
    #[error("invalid frame length: {0}")]
    InvalidLength(u16),

    /// The frame can never fit in the read buffer
    #[error("frame too large: claimed {claimed} bytes, {available} buffered, capacity {capacity}")]
    FrameTooLarge {
        claimed: usize,
        available: usize,
        capacity: usize,
    },

    /// Payload is too big to be described by a 16-bit length field
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Not enough room left in the destination buffer
    #[error("insufficient buffer space: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: usize, available: usize },
}

/// Result type for framing operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// Header of a complete, buffered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw value of the length field
    pub declared: u16,
    /// Number of payload bytes following the header
    pub payload_len: usize,
}

impl FrameHeader {
    /// Total number of bytes the frame occupies on the wire.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len
    }
}

/// Translates a declared length into a payload length.
fn payload_len(declared: u16) -> FrameResult<usize> {
    match declared {
        0 => Err(FrameError::InvalidLength(declared)),
        EMPTY_FRAME_SENTINEL => Ok(0),
        n => Ok(n as usize - HEADER_LEN),
    }
}

/// Inspects the front of `buf` for a complete frame.
///
/// # Arguments
///
/// * `buf` - Buffered bytes, oldest first
/// * `max_frame_len` - Largest frame the caller is able to buffer
///
/// # Returns
///
/// - `Ok(Some(header))` - a complete frame is available
/// - `Ok(None)` - fewer bytes than the frame needs are buffered
/// - `Err(e)` - the length field is malformed
pub fn parse_frame(buf: &[u8], max_frame_len: usize) -> FrameResult<Option<FrameHeader>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let declared = u16::from_le_bytes([buf[0], buf[1]]);
    let payload_len = payload_len(declared)?;
    let header = FrameHeader {
        declared,
        payload_len,
    };

    if header.frame_len() > max_frame_len {
        return Err(FrameError::FrameTooLarge {
            claimed: header.frame_len(),
            available: buf.len(),
            capacity: max_frame_len,
        });
    }

    if buf.len() < header.frame_len() {
        return Ok(None);
    }

    Ok(Some(header))
}

/// Incremental frame parser bound to a read buffer capacity.
///
/// # Example
///
/// ```
/// use gsnet::protocol::FrameParser;
/// use bytes::BytesMut;
///
/// let parser = FrameParser::new(1024);
/// let mut buffer = BytesMut::from(&[0x07, 0x00, b'H', b'E', b'L', b'L', b'O'][..]);
///
/// let payload = parser.next_frame(&mut buffer).unwrap().unwrap();
/// assert_eq!(&payload[..], b"HELLO");
/// assert!(buffer.is_empty());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameParser {
    max_frame_len: usize,
}

impl FrameParser {
    /// Creates a parser that rejects frames longer than `max_frame_len`.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Largest frame this parser accepts.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Checks whether a complete frame sits at the front of `buf`.
    pub fn parse(&self, buf: &[u8]) -> FrameResult<Option<FrameHeader>> {
        parse_frame(buf, self.max_frame_len)
    }

    /// Removes the next complete frame from `buf` and returns its payload.
    ///
    /// The returned `Bytes` is an independent read-only view of the payload;
    /// the header and payload are consumed from `buf`, leaving any partial
    /// frame at the front of the buffer.
    pub fn next_frame(&self, buf: &mut BytesMut) -> FrameResult<Option<Bytes>> {
        match self.parse(buf)? {
            Some(header) => {
                buf.advance(HEADER_LEN);
                Ok(Some(buf.split_to(header.payload_len).freeze()))
            }
            None => Ok(None),
        }
    }
}

/// Appends `payload` to `dst` as a single frame.
///
/// `dst` is treated as a fixed-size buffer: the frame must fit in the spare
/// capacity, the buffer is never grown.
pub fn write_frame(dst: &mut BytesMut, payload: &[u8]) -> FrameResult<()> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let needed = HEADER_LEN + payload.len();
    let available = dst.capacity() - dst.len();
    if needed > available {
        return Err(FrameError::InsufficientSpace { needed, available });
    }

    dst.put_u16_le(needed as u16);
    dst.put_slice(payload);
    Ok(())
}

/// Encodes `payload` into a freshly allocated frame.
pub fn encode_frame(payload: &[u8]) -> FrameResult<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    write_frame(&mut buf, payload)?;
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: usize = 1024;

    fn drain(parser: &FrameParser, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(payload) = parser.next_frame(buf).unwrap() {
            frames.push(payload);
        }
        frames
    }

    #[test]
    fn test_single_frame() {
        let parser = FrameParser::new(CAPACITY);
        let mut buf = BytesMut::from(&[0x07, 0x00, b'H', b'E', b'L', b'L', b'O'][..]);

        let frames = drain(&parser, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"HELLO");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_declared_length_waits_for_whole_frame() {
        // Declared length 9 needs 7 payload bytes, only 5 are here.
        let parser = FrameParser::new(CAPACITY);
        let mut buf = BytesMut::from(&[0x09, 0x00, b'H', b'E', b'L', b'L', b'O'][..]);

        assert_eq!(parser.next_frame(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(b"!!");
        let payload = parser.next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], b"HELLO!!");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sentinel_length_yields_empty_payload() {
        let parser = FrameParser::new(CAPACITY);
        let mut buf = BytesMut::from(&[0x01, 0x00, 0x03, 0x00, 0xAA][..]);

        let frames = drain(&parser, &mut buf);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_empty());
        assert_eq!(&frames[1][..], &[0xAA]);
    }

    #[test]
    fn test_header_only_frame() {
        let parser = FrameParser::new(CAPACITY);
        let mut buf = BytesMut::from(&[0x02, 0x00][..]);

        let payload = parser.next_frame(&mut buf).unwrap().unwrap();
        assert!(payload.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let parser = FrameParser::new(CAPACITY);
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x01][..]);

        assert_eq!(
            parser.next_frame(&mut buf),
            Err(FrameError::InvalidLength(0))
        );
    }

    #[test]
    fn test_frame_larger_than_buffer_is_rejected() {
        let parser = FrameParser::new(16);
        let mut buf = BytesMut::from(&[0x20, 0x00, 0x01, 0x02][..]);

        assert_eq!(
            parser.next_frame(&mut buf),
            Err(FrameError::FrameTooLarge {
                claimed: 32,
                available: 4,
                capacity: 16,
            })
        );
    }

    #[test]
    fn test_incomplete_header() {
        let parser = FrameParser::new(CAPACITY);
        let mut buf = BytesMut::from(&[0x07][..]);

        assert_eq!(parser.next_frame(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_partial_frame_left_at_front() {
        let parser = FrameParser::new(CAPACITY);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"first").unwrap());
        buf.extend_from_slice(&[0x06, 0x00, b'a']);

        let frames = drain(&parser, &mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(&buf[..], &[0x06, 0x00, b'a']);
    }

    #[test]
    fn test_split_invariance() {
        let parser = FrameParser::new(CAPACITY);
        let mut stream = BytesMut::new();
        for payload in [&b"alpha"[..], b"", b"gamma-delta", b"x"] {
            stream.extend_from_slice(&encode_frame(payload).unwrap());
        }
        stream.extend_from_slice(&[0x01, 0x00]);

        let mut whole = stream.clone();
        let expected = drain(&parser, &mut whole);
        assert_eq!(expected.len(), 5);

        for split in 0..=stream.len() {
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();

            buf.extend_from_slice(&stream[..split]);
            frames.extend(drain(&parser, &mut buf));
            buf.extend_from_slice(&stream[split..]);
            frames.extend(drain(&parser, &mut buf));

            assert_eq!(frames, expected, "split at {}", split);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let parser = FrameParser::new(CAPACITY);
        let stream = [encode_frame(b"one").unwrap(), encode_frame(b"two").unwrap()].concat();

        let mut buf = BytesMut::new();
        let mut frames = Vec::new();
        for byte in stream {
            buf.put_u8(byte);
            frames.extend(drain(&parser, &mut buf));
        }

        assert_eq!(frames, vec![Bytes::from("one"), Bytes::from("two")]);
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(b"HELLO").unwrap();
        assert_eq!(&frame[..], &[0x07, 0x00, b'H', b'E', b'L', b'L', b'O']);
    }

    #[test]
    fn test_write_frame_respects_capacity() {
        let mut buf = BytesMut::with_capacity(8);
        let capacity = buf.capacity();

        write_frame(&mut buf, b"abc").unwrap();
        let err = write_frame(&mut buf, &vec![0u8; capacity]).unwrap_err();

        assert!(matches!(err, FrameError::InsufficientSpace { .. }));
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode_frame(&payload),
            Err(FrameError::PayloadTooLarge {
                size: MAX_PAYLOAD_LEN + 1,
                max: MAX_PAYLOAD_LEN,
            })
        );
    }
}
