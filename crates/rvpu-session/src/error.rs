use rvpu_peer::PeerError;

use crate::client::SessionState;
use crate::config::CodecKind;

/// A configuration record that cannot be accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Payload length does not match the record's fixed size.
    #[error("{record} record is {expected} bytes, got {got}")]
    SizeMismatch {
        record: &'static str,
        expected: usize,
        got: usize,
    },

    /// A field lies outside the range the backend supports.
    #[error("{field} = {value} outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    /// A codec record for a different codec than the session runs.
    #[error("codec record for {got}, session runs {expected}")]
    CodecMismatch { expected: CodecKind, got: CodecKind },
}

/// A buffer descriptor that cannot be decoded or imported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor is {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("unknown buffer kind {0}")]
    UnknownKind(u32),

    /// The opaque handle names no region known to the importer.
    #[error("no shared region for handle {0:#x}")]
    UnknownHandle(u64),

    /// The descriptor claims more bytes than the region holds.
    #[error("descriptor size {size} exceeds region capacity {capacity}")]
    RegionTooSmall { size: u64, capacity: usize },
}

/// Failures reported by a backend codec engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Nothing is ready to drain yet; the caller may retry.
    #[error("engine has no output ready")]
    NotReady,

    #[error("engine not initialized")]
    NotInitialized,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("engine failure: {0}")]
    Failed(String),
}

/// Errors surfaced by the client session adapter and the dispatcher loop.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The channel failed; the session is disconnected and must reconnect.
    #[error("connection error: {0}")]
    Connection(#[from] PeerError),

    /// Operation not allowed in the current state. The channel was not used.
    #[error("{op} not allowed in state {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("invalid buffer descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    /// Session setup could not build its INIT payload or engine.
    #[error("session allocation failed: {0}")]
    Allocation(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
