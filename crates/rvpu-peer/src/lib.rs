//! Channel management for the remote VPU protocol.
//!
//! Connect to the engine host, agree on the channel tag, and exchange
//! primitives. One channel carries one session.

pub mod channel;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod listener;

pub use channel::Channel;
pub use connector::{connect, connect_with_config, disconnect, ConnectConfig};
pub use error::{PeerError, Result};
pub use handshake::{
    handshake_client, handshake_server, HandshakeConfig, CHANNEL_TAG_RVPU, TAG_REJECT,
};
pub use listener::RemoteListener;
