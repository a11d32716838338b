//! `tokio_util` codec adapter, for hosts that drive channels from an async
//! runtime via `Framed`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_frame, encode_frame, FrameConfig};
use crate::error::FrameError;
use crate::primitive::Primitive;

/// Stateless primitive codec bounded by a [`FrameConfig`].
#[derive(Debug, Clone, Default)]
pub struct PrimitiveCodec {
    config: FrameConfig,
}

impl PrimitiveCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }
}

impl Decoder for PrimitiveCodec {
    type Item = Primitive;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_frame(src, self.config.max_payload_size) {
            Err(err @ FrameError::MalformedHeader { .. }) => {
                src.clear();
                Err(err)
            }
            other => other,
        }
    }
}

impl Encoder<Primitive> for PrimitiveCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Primitive, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item.code, &item.payload, dst, self.config.max_frame_size)
    }
}
