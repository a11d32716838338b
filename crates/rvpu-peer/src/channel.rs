use std::time::Duration;

use rvpu_frame::{
    is_timeout, FrameConfig, FrameError, Primitive, PrimitiveCode, PrimitiveReader, PrimitiveWriter,
};
use rvpu_transport::RemoteStream;
use tracing::{debug, trace};

use crate::error::{PeerError, Result};

/// One established, handshaken remote VPU channel.
///
/// Carries exactly one session. Reads and writes own separate descriptors of
/// the same socket.
pub struct Channel {
    id: String,
    tag: u8,
    reader: PrimitiveReader<RemoteStream>,
    writer: PrimitiveWriter<RemoteStream>,
    recv_timeout: Option<Duration>,
}

impl Channel {
    /// Wrap a stream whose handshake already completed.
    pub fn from_stream(
        id: impl Into<String>,
        tag: u8,
        stream: RemoteStream,
        config: FrameConfig,
    ) -> Result<Self> {
        let reader_stream = stream.try_clone()?;
        let recv_timeout = config.read_timeout;
        let reader = PrimitiveReader::with_config_stream(reader_stream, config.clone())?;
        let writer = PrimitiveWriter::with_config_stream(stream, config)?;
        Ok(Self {
            id: id.into(),
            tag,
            reader,
            writer,
            recv_timeout,
        })
    }

    /// Two connected channels in one process, without a rendezvous path.
    pub fn pair() -> Result<(Self, Self)> {
        Self::pair_with_config(FrameConfig::default())
    }

    pub fn pair_with_config(config: FrameConfig) -> Result<(Self, Self)> {
        let (left, right) = RemoteStream::pair()?;
        let client = Self::from_stream("pair-client", crate::CHANNEL_TAG_RVPU, left, config.clone())?;
        let server = Self::from_stream("pair-server", crate::CHANNEL_TAG_RVPU, right, config)?;
        Ok((client, server))
    }

    /// Identifier used in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Channel-type tag agreed during the handshake.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Send one primitive.
    pub fn send(&mut self, code: PrimitiveCode, payload: &[u8]) -> Result<()> {
        trace!(channel = %self.id, %code, len = payload.len(), "send");
        self.writer.send(code, payload).map_err(map_frame_error)
    }

    /// Send a primitive as built, unknown codes included.
    pub fn send_primitive(&mut self, prim: &Primitive) -> Result<()> {
        self.writer.write_primitive(prim).map_err(map_frame_error)
    }

    /// Block for the next primitive, up to the receive timeout if one is set.
    pub fn recv(&mut self) -> Result<Primitive> {
        match self.reader.read_primitive() {
            Ok(prim) => {
                trace!(channel = %self.id, name = prim.name(), len = prim.len(), "recv");
                Ok(prim)
            }
            Err(err) if is_timeout(&err) => {
                Err(PeerError::Timeout(self.recv_timeout.unwrap_or_default()))
            }
            Err(err) => Err(map_frame_error(err)),
        }
    }

    /// Change the receive deadline; `None` blocks indefinitely.
    pub fn set_recv_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.reader.set_read_timeout(timeout)?;
        self.recv_timeout = timeout;
        Ok(())
    }

    /// Current receive deadline.
    pub fn recv_timeout(&self) -> Option<Duration> {
        self.recv_timeout
    }

    /// Send DEINIT best effort, then shut the socket down.
    pub fn disconnect(mut self) {
        if let Err(err) = self.writer.send(PrimitiveCode::Deinit, &[]) {
            debug!(channel = %self.id, error = %err, "DEINIT not delivered");
        }
        self.shutdown();
    }

    /// Shut both directions down without a farewell.
    pub fn shutdown(&self) {
        self.writer.get_ref().shutdown();
    }

    /// Linux credentials of the remote end as `(uid, gid, pid)`.
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        self.writer.get_ref().peer_credentials()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("recv_timeout", &self.recv_timeout)
            .finish()
    }
}

fn map_frame_error(err: FrameError) -> PeerError {
    match err {
        FrameError::ConnectionClosed => PeerError::Disconnected("peer closed the channel".to_string()),
        FrameError::Io(io)
            if matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
            ) =>
        {
            PeerError::Disconnected(io.to_string())
        }
        other => PeerError::Frame(other),
    }
}
