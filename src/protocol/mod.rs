//! Game Protocol Framing
//!
//! This module provides the framing layer used on every client connection.
//! Frames are length-prefixed with a 2-byte little-endian length that counts
//! the header itself. What the payload means is up to the application.
//!
//! ## Modules
//!
//! - `parser`: Incremental frame parser and frame encoders
//!
//! ## Example
//!
//! ```
//! use gsnet::protocol::{encode_frame, FrameParser};
//! use bytes::BytesMut;
//!
//! // Framing outgoing data
//! let frame = encode_frame(b"HELLO").unwrap();
//! assert_eq!(&frame[..2], &[0x07, 0x00]);
//!
//! // Parsing incoming data
//! let mut buffer = BytesMut::from(&frame[..]);
//! let payload = FrameParser::new(8192).next_frame(&mut buffer).unwrap();
//! assert_eq!(payload.as_deref(), Some(&b"HELLO"[..]));
//! ```

pub mod parser;

// Re-export commonly used types for convenience
pub use parser::{
    encode_frame, parse_frame, write_frame, FrameError, FrameHeader, FrameParser, FrameResult,
    EMPTY_FRAME_SENTINEL, HEADER_LEN, MAX_PAYLOAD_LEN,
};
