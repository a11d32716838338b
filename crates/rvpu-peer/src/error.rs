/// Errors that can occur on a remote VPU channel.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] rvpu_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] rvpu_frame::FrameError),

    /// The server answered the handshake with a different tag.
    #[error("handshake mismatch: sent tag {expected:#04x}, peer answered {got:#04x}")]
    HandshakeMismatch { expected: u8, got: u8 },

    /// A client offered a channel tag this endpoint does not serve.
    #[error("unsupported channel tag {0:#04x}")]
    UnsupportedTag(u8),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// A blocking read hit its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl PeerError {
    /// True when the error means the channel is unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;
