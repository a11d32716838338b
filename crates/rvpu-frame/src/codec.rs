use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::primitive::{Primitive, PrimitiveCode};

/// Largest payload one primitive carries by default.
pub const MAX_CONTEXT_SIZE: usize = 512;

/// Default transmit buffer capacity: header allowance plus one full payload.
pub const DEFAULT_TX_CAPACITY: usize = 8 + MAX_CONTEXT_SIZE;

/// Token delimiter.
const DELIMITER: u8 = b':';
/// A NUL byte also terminates a header token.
const STOP: u8 = b'\0';
/// Enough decimal digits for any `u32`.
const MAX_TOKEN_DIGITS: usize = 10;

/// Parsed `<code>:<length>:` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw primitive code.
    pub code: u32,
    /// Payload byte count that follows the header.
    pub length: usize,
    /// Bytes taken by the header itself, delimiters included.
    pub consumed: usize,
}

impl FrameHeader {
    /// Typed code, `None` when outside the table.
    pub fn kind(&self) -> Option<PrimitiveCode> {
        PrimitiveCode::from_wire(self.code)
    }
}

/// Framing limits and socket deadlines.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest encoded frame (header + payload) accepted for sending.
    pub max_frame_size: usize,
    /// Largest payload accepted from the peer.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_TX_CAPACITY,
            max_payload_size: MAX_CONTEXT_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Encode one primitive into `dst`.
///
/// Fails with [`FrameError::FrameTooLarge`] when header plus payload would
/// exceed `max_frame`; `dst` is left untouched in that case.
pub fn encode_frame(code: u32, payload: &[u8], dst: &mut BytesMut, max_frame: usize) -> Result<()> {
    let header = format!("{code}:{}:", payload.len());
    let total = header.len() + payload.len();
    if total > max_frame {
        return Err(FrameError::FrameTooLarge {
            size: total,
            max: max_frame,
        });
    }

    dst.reserve(total);
    dst.put_slice(header.as_bytes());
    dst.put_slice(payload);
    Ok(())
}

/// Encode one primitive against the default transmit capacity.
pub fn encode(code: PrimitiveCode, payload: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    encode_frame(code.wire(), payload, &mut dst, DEFAULT_TX_CAPACITY)?;
    Ok(dst.freeze())
}

/// Parse a complete header at the start of `src`.
///
/// A missing delimiter is an error here; use [`try_decode_header`] when more
/// bytes may still arrive.
pub fn decode_header(src: &[u8]) -> Result<FrameHeader> {
    try_decode_header(src)?.ok_or(FrameError::MalformedHeader {
        reason: "missing delimiter",
    })
}

/// Parse a header, returning `Ok(None)` while the bytes seen so far are a
/// valid but unfinished prefix.
pub fn try_decode_header(src: &[u8]) -> Result<Option<FrameHeader>> {
    let Some((code, code_len)) = scan_token(src)? else {
        return Ok(None);
    };
    let Some((length, length_len)) = scan_token(&src[code_len..])? else {
        return Ok(None);
    };

    Ok(Some(FrameHeader {
        code,
        length: length as usize,
        consumed: code_len + length_len,
    }))
}

/// Returns the token value and the bytes it used, delimiter included.
fn scan_token(src: &[u8]) -> Result<Option<(u32, usize)>> {
    for (index, &byte) in src.iter().enumerate() {
        if byte == DELIMITER || byte == STOP {
            if index == 0 {
                return Err(FrameError::MalformedHeader {
                    reason: "empty token",
                });
            }
            return parse_decimal(&src[..index]).map(|value| Some((value, index + 1)));
        }
        if index >= MAX_TOKEN_DIGITS {
            return Err(FrameError::MalformedHeader {
                reason: "token too long",
            });
        }
        if !byte.is_ascii_digit() {
            return Err(FrameError::MalformedHeader {
                reason: "non-numeric token",
            });
        }
    }
    Ok(None)
}

fn parse_decimal(digits: &[u8]) -> Result<u32> {
    digits.iter().try_fold(0u32, |acc, &digit| {
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add(u32::from(digit - b'0')))
            .ok_or(FrameError::MalformedHeader {
                reason: "value overflows u32",
            })
    })
}

/// Decode one primitive from a growing receive buffer.
///
/// Returns `Ok(None)` if the buffer does not yet hold a complete primitive;
/// on success the primitive's bytes are consumed from `src`.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Primitive>> {
    let Some(header) = try_decode_header(src)? else {
        return Ok(None);
    };

    if header.length > max_payload {
        return Err(FrameError::FrameTooLarge {
            size: header.length,
            max: max_payload,
        });
    }

    if src.len() < header.consumed + header.length {
        return Ok(None);
    }

    src.advance(header.consumed);
    let payload = src.split_to(header.length).freeze();
    Ok(Some(Primitive {
        code: header.code,
        payload,
    }))
}

/// Decode every primitive in one received transmission unit.
pub fn decode_stream(src: impl Into<Bytes>) -> PrimitiveStream {
    PrimitiveStream {
        remaining: src.into(),
        done: false,
    }
}

/// Lazy iterator over the primitives of one buffer.
///
/// Yields at most one error, after which it is exhausted: a corrupt header
/// leaves no trustworthy boundary to resume from.
#[derive(Debug)]
pub struct PrimitiveStream {
    remaining: Bytes,
    done: bool,
}

impl PrimitiveStream {
    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &[u8] {
        &self.remaining
    }
}

impl Iterator for PrimitiveStream {
    type Item = Result<Primitive>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining.is_empty() {
            return None;
        }

        let header = match decode_header(&self.remaining) {
            Ok(header) => header,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        let available = self.remaining.len() - header.consumed;
        if header.length > available {
            self.done = true;
            return Some(Err(FrameError::TruncatedFrame {
                declared: header.length,
                available,
            }));
        }

        self.remaining.advance(header.consumed);
        let payload = self.remaining.split_to(header.length);
        Some(Ok(Primitive {
            code: header.code,
            payload,
        }))
    }
}

impl std::iter::FusedIterator for PrimitiveStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_writes_ascii_header() {
        let wire = encode(PrimitiveCode::Init, b"").unwrap();
        assert_eq!(wire.as_ref(), b"1:0:");

        let wire = encode(PrimitiveCode::ControlSei, &[1, 0, 0, 0]).unwrap();
        assert_eq!(wire.as_ref(), b"9:4:\x01\x00\x00\x00");
    }

    #[test]
    fn decode_header_of_prep_control() {
        let mut wire = b"6:12:".to_vec();
        wire.extend_from_slice(&[0u8; 12]);

        let header = decode_header(&wire).unwrap();
        assert_eq!(header.kind(), Some(PrimitiveCode::ControlPrep));
        assert_eq!(header.length, 12);
        assert_eq!(header.consumed, 5);
    }

    #[test]
    fn nul_terminates_token() {
        let header = decode_header(b"5\x000\x00").unwrap();
        assert_eq!((header.code, header.length, header.consumed), (5, 0, 4));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let bad_headers: [&[u8]; 6] = [
            b"x:0:",
            b":0:",
            b"1::",
            b"1:a:",
            b"99999999999:0:",
            b"4294967296:0:",
        ];
        for bad in bad_headers {
            let err = decode_header(bad).unwrap_err();
            assert!(matches!(err, FrameError::MalformedHeader { .. }), "{bad:?}");
        }
    }

    #[test]
    fn missing_delimiter_is_malformed_but_incomplete_when_streaming() {
        assert!(matches!(
            decode_header(b"4:3"),
            Err(FrameError::MalformedHeader { .. })
        ));
        assert_eq!(try_decode_header(b"4:3").unwrap(), None);
        assert_eq!(try_decode_header(b"").unwrap(), None);
    }

    #[test]
    fn payload_bytes_are_not_scanned() {
        let wire = encode(PrimitiveCode::Control, b"a:b:\0:c").unwrap();
        let prims: Vec<_> = decode_stream(wire).collect::<Result<_>>().unwrap();
        assert_eq!(prims.len(), 1);
        assert_eq!(prims[0].payload.as_ref(), b"a:b:\0:c");
    }

    #[test]
    fn oversized_frame_rejected_without_writing() {
        let payload = vec![0xAB; MAX_CONTEXT_SIZE + 64];
        let mut dst = BytesMut::new();
        let err = encode_frame(4, &payload, &mut dst, DEFAULT_TX_CAPACITY).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(dst.is_empty());
    }

    #[test]
    fn full_context_payload_fits_default_capacity() {
        let payload = vec![7u8; MAX_CONTEXT_SIZE];
        let wire = encode(PrimitiveCode::ControlCodec, &payload).unwrap();
        assert_eq!(wire.len(), "8:512:".len() + MAX_CONTEXT_SIZE);
    }

    #[test]
    fn stream_reports_truncation_once() {
        let mut wire = encode(PrimitiveCode::Reset, b"").unwrap().to_vec();
        wire.extend_from_slice(b"4:32:short");

        let mut stream = decode_stream(wire);
        assert_eq!(stream.next().unwrap().unwrap().kind(), Some(PrimitiveCode::Reset));
        assert!(matches!(
            stream.next(),
            Some(Err(FrameError::TruncatedFrame {
                declared: 32,
                available: 5
            }))
        ));
        assert!(stream.next().is_none());
    }

    #[test]
    fn stream_stops_after_malformed_header() {
        let mut stream = decode_stream(&b"1:0:zz:0:2:0:"[..]);
        assert!(stream.next().unwrap().is_ok());
        assert!(matches!(
            stream.next(),
            Some(Err(FrameError::MalformedHeader { .. }))
        ));
        assert!(stream.next().is_none());
        assert_eq!(stream.remaining(), b"zz:0:2:0:");
    }

    #[test]
    fn decode_frame_waits_for_payload() {
        let mut buf = BytesMut::from(&b"4:3:ab"[..]);
        assert!(decode_frame(&mut buf, MAX_CONTEXT_SIZE).unwrap().is_none());
        buf.extend_from_slice(b"c");
        let prim = decode_frame(&mut buf, MAX_CONTEXT_SIZE).unwrap().unwrap();
        assert_eq!(prim.payload.as_ref(), b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_frame_bounds_declared_length() {
        let mut buf = BytesMut::from(&b"4:100000:"[..]);
        let err = decode_frame(&mut buf, MAX_CONTEXT_SIZE).unwrap_err();
        assert!(matches!(
            err,
            FrameError::FrameTooLarge {
                size: 100000,
                max: MAX_CONTEXT_SIZE
            }
        ));
    }

    fn arb_code() -> impl Strategy<Value = PrimitiveCode> {
        (0usize..PrimitiveCode::ALL.len()).prop_map(|index| PrimitiveCode::ALL[index])
    }

    proptest! {
        #[test]
        fn header_recovers_code_and_length(
            code in arb_code(),
            payload in proptest::collection::vec(any::<u8>(), 0..MAX_CONTEXT_SIZE),
        ) {
            let wire = encode(code, &payload).unwrap();
            let header = decode_header(&wire).unwrap();
            prop_assert_eq!(header.kind(), Some(code));
            prop_assert_eq!(header.length, payload.len());
            prop_assert_eq!(header.consumed + payload.len(), wire.len());
        }

        #[test]
        fn sequence_survives_in_order(
            prims in proptest::collection::vec(
                (arb_code(), proptest::collection::vec(any::<u8>(), 0..64)),
                0..16,
            ),
        ) {
            let mut wire = BytesMut::new();
            for (code, payload) in &prims {
                encode_frame(code.wire(), payload, &mut wire, DEFAULT_TX_CAPACITY).unwrap();
            }

            let decoded: Vec<Primitive> = decode_stream(wire.freeze()).collect::<Result<_>>().unwrap();
            prop_assert_eq!(decoded.len(), prims.len());
            for (prim, (code, payload)) in decoded.iter().zip(&prims) {
                prop_assert_eq!(prim.kind(), Some(*code));
                prop_assert_eq!(prim.payload.as_ref(), payload.as_slice());
            }
        }
    }
}
