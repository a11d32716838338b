//! Stream transport for the remote VPU channel.
//!
//! The codec client and the engine host talk over one persistent Unix domain
//! stream socket reached through a well-known rendezvous path. This crate owns
//! the socket plumbing only; framing and handshakes live in the crates above.

#[cfg(not(unix))]
compile_error!("rvpu-transport requires Unix domain sockets");

pub mod error;
pub mod stream;
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::RemoteStream;
pub use uds::{default_endpoint, RendezvousSocket, DEFAULT_ENDPOINT, ENDPOINT_ENV};
