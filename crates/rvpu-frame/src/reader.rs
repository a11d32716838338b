use std::io::{ErrorKind, Read};
use std::time::Duration;

use bytes::BytesMut;
use rvpu_transport::RemoteStream;
use tracing::warn;

use crate::codec::{decode_frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::primitive::Primitive;

const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;
const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Reads complete primitives from any `Read` stream.
///
/// Partial reads are absorbed internally. Declared payload lengths are bounded
/// by `FrameConfig::max_payload_size`, never by the peer.
pub struct PrimitiveReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> PrimitiveReader<T> {
    /// Create a reader with default limits.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a reader with explicit limits.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete primitive (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` at EOF. After a
    /// `MalformedHeader` the buffered bytes are discarded, since no later
    /// frame boundary in them can be trusted.
    pub fn read_primitive(&mut self) -> Result<Primitive> {
        loop {
            match decode_frame(&mut self.buf, self.config.max_payload_size) {
                Ok(Some(prim)) => return Ok(prim),
                Ok(None) => {}
                Err(err @ (FrameError::MalformedHeader { .. } | FrameError::FrameTooLarge { .. })) => {
                    warn!(error = %err, dropped = self.buf.len(), "discarding receive buffer");
                    self.buf.clear();
                    return Err(err);
                }
                Err(err) => return Err(err),
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes received but not yet returned as a primitive.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current limits.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl PrimitiveReader<RemoteStream> {
    /// Create a reader over a channel stream and apply its read timeout.
    pub fn with_config_stream(inner: RemoteStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the receive deadline for subsequent reads.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

pub(crate) fn transport_to_frame_error(err: rvpu_transport::TransportError) -> FrameError {
    match err {
        rvpu_transport::TransportError::Io(io) | rvpu_transport::TransportError::Accept(io) => {
            FrameError::Io(io)
        }
        rvpu_transport::TransportError::Bind { source, .. }
        | rvpu_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

/// True for the error kinds a socket read timeout produces.
pub fn is_timeout(err: &FrameError) -> bool {
    matches!(err, FrameError::Io(io) if io.kind() == ErrorKind::WouldBlock || io.kind() == ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::{encode_frame, DEFAULT_TX_CAPACITY};
    use crate::primitive::PrimitiveCode;
    use crate::writer::PrimitiveWriter;

    fn wire(prims: &[(PrimitiveCode, &[u8])]) -> Vec<u8> {
        let mut out = BytesMut::new();
        for (code, payload) in prims {
            encode_frame(code.wire(), payload, &mut out, DEFAULT_TX_CAPACITY).unwrap();
        }
        out.to_vec()
    }

    #[test]
    fn reads_start_then_wait() {
        let bytes = wire(&[
            (PrimitiveCode::Start, &[1u8; 32]),
            (PrimitiveCode::Wait, &[2u8; 32]),
        ]);
        let mut reader = PrimitiveReader::new(Cursor::new(bytes));

        let start = reader.read_primitive().unwrap();
        let wait = reader.read_primitive().unwrap();
        assert_eq!(start.kind(), Some(PrimitiveCode::Start));
        assert_eq!(wait.kind(), Some(PrimitiveCode::Wait));
        assert_eq!(wait.payload.as_ref(), &[2u8; 32]);
        assert!(matches!(
            reader.read_primitive(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn byte_by_byte_delivery() {
        let bytes = wire(&[(PrimitiveCode::ControlSei, &[3, 0, 0, 0])]);
        let mut reader = PrimitiveReader::new(ByteByByteReader { bytes, pos: 0 });

        let prim = reader.read_primitive().unwrap();
        assert_eq!(prim.kind(), Some(PrimitiveCode::ControlSei));
        assert_eq!(prim.payload.as_ref(), &[3, 0, 0, 0]);
    }

    #[test]
    fn eof_mid_payload_is_connection_closed() {
        let mut reader = PrimitiveReader::new(Cursor::new(b"4:32:partial".to_vec()));
        assert!(matches!(
            reader.read_primitive(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn malformed_header_discards_buffer() {
        let mut reader = PrimitiveReader::new(Cursor::new(b"1:0:garbage:0:11:0:".to_vec()));
        assert_eq!(
            reader.read_primitive().unwrap().kind(),
            Some(PrimitiveCode::Init)
        );
        assert!(matches!(
            reader.read_primitive(),
            Err(FrameError::MalformedHeader { .. })
        ));
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn declared_length_bounded_by_receive_capacity() {
        let cfg = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = PrimitiveReader::with_config(Cursor::new(b"8:1024:".to_vec()), cfg);
        assert!(matches!(
            reader.read_primitive(),
            Err(FrameError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn interrupted_read_retries() {
        let bytes = wire(&[(PrimitiveCode::Flush, b"")]);
        let mut reader = PrimitiveReader::new(InterruptedOnce {
            interrupted: false,
            inner: Cursor::new(bytes),
        });
        assert_eq!(
            reader.read_primitive().unwrap().kind(),
            Some(PrimitiveCode::Flush)
        );
    }

    #[test]
    fn timeout_on_remote_stream_is_recognised() {
        let (left, _right) = RemoteStream::pair().unwrap();
        let cfg = FrameConfig {
            read_timeout: Some(Duration::from_millis(5)),
            ..FrameConfig::default()
        };
        let mut reader = PrimitiveReader::with_config_stream(left, cfg).unwrap();
        let err = reader.read_primitive().unwrap_err();
        assert!(is_timeout(&err), "{err:?}");
    }

    #[test]
    fn roundtrip_over_stream_pair() {
        let (left, right) = RemoteStream::pair().unwrap();
        let mut writer = PrimitiveWriter::new(left);
        let mut reader = PrimitiveReader::new(right);

        writer.send(PrimitiveCode::Init, b"").unwrap();
        writer.send(PrimitiveCode::Reset, b"").unwrap();
        writer.send(PrimitiveCode::Deinit, b"").unwrap();

        let codes: Vec<_> = (0..3)
            .map(|_| reader.read_primitive().unwrap().kind().unwrap())
            .collect();
        assert_eq!(
            codes,
            vec![PrimitiveCode::Init, PrimitiveCode::Reset, PrimitiveCode::Deinit]
        );
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedOnce {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedOnce {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }
}
