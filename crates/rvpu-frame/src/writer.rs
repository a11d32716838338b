use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use rvpu_transport::RemoteStream;
use tracing::trace;

use crate::codec::{encode_frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::primitive::{Primitive, PrimitiveCode};
use crate::reader::transport_to_frame_error;

/// Writes complete primitives to any `Write` stream.
///
/// Each primitive is encoded into a transmit buffer sized by
/// `FrameConfig::max_frame_size` and written in full before `send` returns.
pub struct PrimitiveWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> PrimitiveWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(config.max_frame_size),
            config,
        }
    }

    /// Encode and send one typed primitive.
    pub fn send(&mut self, code: PrimitiveCode, payload: &[u8]) -> Result<()> {
        self.send_raw(code.wire(), payload)
    }

    /// Send an already-built primitive, unknown codes included.
    pub fn write_primitive(&mut self, prim: &Primitive) -> Result<()> {
        self.send_raw(prim.code, prim.payload.as_ref())
    }

    /// Encode and send a primitive with a raw wire code.
    ///
    /// Nothing reaches the stream when the frame exceeds the transmit
    /// capacity.
    pub fn send_raw(&mut self, code: u32, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_frame(code, payload, &mut self.buf, self.config.max_frame_size)?;

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // A send deadline surfaces as WouldBlock; the frame may be partly written.
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        trace!(code, len = payload.len(), "primitive sent");

        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl PrimitiveWriter<RemoteStream> {
    /// Create a writer over a channel stream and apply its write timeout.
    pub fn with_config_stream(inner: RemoteStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }
}
