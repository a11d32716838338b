/// Errors raised while framing or parsing primitives.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The `<code>:<length>:` header could not be parsed.
    #[error("malformed primitive header: {reason}")]
    MalformedHeader { reason: &'static str },

    /// A header announced more payload than the buffer holds.
    #[error("truncated frame (header announces {declared} payload bytes, {available} present)")]
    TruncatedFrame { declared: usize, available: usize },

    /// The frame does not fit the transmit or receive capacity.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing primitives.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel closed before a complete primitive was received.
    #[error("connection closed (incomplete primitive)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
