//! Primitive framing for the remote VPU protocol.
//!
//! Every primitive travels as an ASCII-prefixed binary frame:
//!
//! ```text
//! frame   = code ":" length ":" payload
//! code    = 1*DIGIT   ; primitive code, decimal
//! length  = 1*DIGIT   ; payload byte count, decimal
//! payload = length*OCTET
//! ```
//!
//! The payload is raw and never escaped, so parsing trusts `length` alone.
//! Encoding is bounds-checked against the transmit capacity and decoding
//! against the receive capacity.

pub mod codec;
pub mod error;
pub mod primitive;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub mod async_codec;

pub use codec::{
    decode_frame, decode_header, decode_stream, encode, encode_frame, try_decode_header, FrameConfig,
    FrameHeader, PrimitiveStream, DEFAULT_TX_CAPACITY, MAX_CONTEXT_SIZE,
};
pub use error::{FrameError, Result};
pub use primitive::{Primitive, PrimitiveCode};
pub use reader::{is_timeout, PrimitiveReader};
pub use writer::PrimitiveWriter;

#[cfg(feature = "async")]
pub use async_codec::PrimitiveCodec;
