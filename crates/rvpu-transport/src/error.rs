use std::path::PathBuf;

/// Errors raised by the remote VPU socket transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the rendezvous endpoint.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to reach the rendezvous endpoint.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming channel.
    #[error("failed to accept channel: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on an established channel.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint path does not fit into `sockaddr_un`.
    #[error("endpoint path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
