use std::path::{Path, PathBuf};
use std::time::Duration;

use rvpu_frame::FrameConfig;
use rvpu_transport::{default_endpoint, RendezvousSocket};
use tracing::info;

use crate::channel::Channel;
use crate::error::Result;
use crate::handshake::{handshake_client, HandshakeConfig, CHANNEL_TAG_RVPU};

/// Client-side connection settings.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Rendezvous path; defaults to `RVPU_ENDPOINT` or the well-known path.
    pub endpoint: PathBuf,
    /// Tag offered in the handshake.
    pub tag: u8,
    /// Deadline for the handshake echo.
    pub handshake_timeout: Duration,
    /// Framing limits applied after the handshake.
    pub frame: FrameConfig,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            tag: CHANNEL_TAG_RVPU,
            handshake_timeout: Duration::from_secs(5),
            frame: FrameConfig::default(),
        }
    }
}

impl ConnectConfig {
    /// Default settings aimed at `endpoint`.
    pub fn for_endpoint(endpoint: impl AsRef<Path>) -> Self {
        Self {
            endpoint: endpoint.as_ref().to_path_buf(),
            ..Self::default()
        }
    }
}

/// Connect to a remote VPU endpoint and complete the handshake.
pub fn connect(endpoint: impl AsRef<Path>) -> Result<Channel> {
    connect_with_config(&ConnectConfig::for_endpoint(endpoint))
}

/// Connect with explicit configuration.
///
/// There is no automatic reconnection; a caller observing a failure calls
/// this again.
pub fn connect_with_config(config: &ConnectConfig) -> Result<Channel> {
    let mut stream = RendezvousSocket::connect(&config.endpoint)?;
    stream.set_read_timeout(Some(config.handshake_timeout))?;
    stream.set_write_timeout(Some(config.handshake_timeout))?;

    let handshake = HandshakeConfig {
        timeout: config.handshake_timeout,
        tag: config.tag,
        ..HandshakeConfig::default()
    };
    let tag = handshake_client(&mut stream, &handshake)?;
    info!(endpoint = ?config.endpoint, tag, "channel connected");

    Channel::from_stream(
        config.endpoint.display().to_string(),
        tag,
        stream,
        config.frame.clone(),
    )
}

/// Tear a channel down: DEINIT best effort, then close.
pub fn disconnect(channel: Channel) {
    channel.disconnect();
}
