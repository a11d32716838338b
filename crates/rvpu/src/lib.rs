//! Remote VPU codec proxy.
//!
//! A codec client on one side of a Unix stream socket drives a hardware
//! codec engine hosted on the other side. Both halves speak a small set of
//! primitives (INIT, START, WAIT, CONTROL_*...) framed as
//! `<code>:<length>:<payload>`.
//!
//! # Crate Structure
//!
//! - [`transport`]: rendezvous socket and stream plumbing
//! - [`frame`]: primitive framing and incremental readers/writers
//! - [`peer`]: handshake, connect/accept and the [`peer::Channel`]
//! - [`session`]: client sessions, the engine-side dispatcher and completion waiting

/// Re-export transport types.
pub mod transport {
    pub use rvpu_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rvpu_frame::*;
}

/// Re-export peer types.
pub mod peer {
    pub use rvpu_peer::*;
}

/// Re-export session types.
pub mod session {
    pub use rvpu_session::*;
}

pub use rvpu_peer::{connect, Channel, RemoteListener};
pub use rvpu_session::{Dispatcher, EngineRegistry, RemoteSession, SessionConfig};
