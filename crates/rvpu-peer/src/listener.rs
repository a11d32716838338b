use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rvpu_frame::FrameConfig;
use rvpu_transport::{RemoteStream, RendezvousSocket};
use tracing::info;

use crate::channel::Channel;
use crate::error::Result;
use crate::handshake::{handshake_server, HandshakeConfig};

/// Listens on the rendezvous endpoint and accepts channels.
pub struct RemoteListener {
    socket: RendezvousSocket,
    handshake_config: HandshakeConfig,
    frame_config: FrameConfig,
    next_channel_id: AtomicU64,
}

impl RemoteListener {
    /// Bind to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let socket = RendezvousSocket::bind(path)?;
        Ok(Self {
            socket,
            handshake_config: HandshakeConfig::default(),
            frame_config: FrameConfig::default(),
            next_channel_id: AtomicU64::new(1),
        })
    }

    /// Override the accepted channel tags.
    pub fn with_accepted_tags(mut self, tags: &[u8]) -> Self {
        self.handshake_config.accepted_tags = tags.to_vec();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_config.timeout = timeout;
        self
    }

    /// Framing limits for accepted channels.
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    /// Accept the next channel and run the server half of the handshake.
    ///
    /// A rejected tag fails this call only; the listener stays usable.
    pub fn accept(&self) -> Result<Channel> {
        let stream = self.socket.accept()?;
        self.establish(stream)
    }

    /// Like [`accept`](Self::accept), but gives up after `timeout` with
    /// `Ok(None)` so the caller can check for shutdown.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<Channel>> {
        match self.socket.accept_timeout(timeout)? {
            Some(stream) => self.establish(stream).map(Some),
            None => Ok(None),
        }
    }

    fn establish(&self, mut stream: RemoteStream) -> Result<Channel> {
        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("channel-{id}");

        if let Some((uid, gid, pid)) = stream.peer_credentials() {
            info!(channel = %id, uid, gid, pid, "accepted channel");
        } else {
            info!(channel = %id, "accepted channel");
        }

        stream.set_read_timeout(Some(self.handshake_config.timeout))?;
        stream.set_write_timeout(Some(self.handshake_config.timeout))?;
        let tag = handshake_server(&mut stream, &self.handshake_config)?;

        Channel::from_stream(id, tag, stream, self.frame_config.clone())
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use rvpu_frame::PrimitiveCode;

    use super::*;
    use crate::connector::{connect, connect_with_config, ConnectConfig};
    use crate::error::PeerError;
    use crate::handshake::TAG_REJECT;

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/rvpul-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("listener.sock")
    }

    #[test]
    fn accept_assigns_sequential_ids() {
        let sock_path = make_sock_path("multi");
        let listener = RemoteListener::bind(&sock_path).expect("listener should bind");

        let server = thread::spawn(move || {
            let first = listener.accept().expect("first accept should succeed");
            let second = listener.accept().expect("second accept should succeed");
            assert_eq!(first.id(), "channel-1");
            assert_eq!(second.id(), "channel-2");
        });

        let _c1 = connect(&sock_path).expect("first client should connect");
        let _c2 = connect(&sock_path).expect("second client should connect");
        server.join().expect("server thread should finish");

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn rejected_tag_fails_both_sides() {
        let sock_path = make_sock_path("reject");
        let listener = RemoteListener::bind(&sock_path).expect("listener should bind");

        let server = thread::spawn(move || {
            let rejected = listener.accept();
            assert!(matches!(rejected, Err(PeerError::UnsupportedTag(0x09))));
        });

        let cfg = ConnectConfig {
            tag: 0x09,
            ..ConnectConfig::for_endpoint(&sock_path)
        };
        let result = connect_with_config(&cfg);
        assert!(matches!(
            result,
            Err(PeerError::HandshakeMismatch { expected: 0x09, got }) if got == TAG_REJECT
        ));
        server.join().expect("server thread should finish");

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn accept_timeout_yields_none_then_channel() {
        let sock_path = make_sock_path("timeout");
        let listener = RemoteListener::bind(&sock_path).expect("listener should bind");

        let idle = listener
            .accept_timeout(Duration::from_millis(20))
            .expect("idle wait should not fail");
        assert!(idle.is_none());

        let client_path = sock_path.clone();
        let client = thread::spawn(move || connect(&client_path).expect("client should connect"));
        let channel = listener
            .accept_timeout(Duration::from_secs(5))
            .expect("accept should succeed")
            .expect("client should arrive");
        assert_eq!(channel.id(), "channel-1");
        let _client = client.join().expect("client thread should finish");

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[test]
    fn accepted_channel_receives_from_client() {
        let sock_path = make_sock_path("recv");
        let listener = RemoteListener::bind(&sock_path).expect("listener should bind");

        let server = thread::spawn(move || {
            let mut channel = listener.accept().expect("listener should accept");
            channel.recv().expect("should receive FLUSH")
        });

        let mut client = connect(&sock_path).expect("client should connect");
        client.send(PrimitiveCode::Flush, b"").expect("FLUSH should send");

        let prim = server.join().expect("server thread should finish");
        assert_eq!(prim.kind(), Some(PrimitiveCode::Flush));

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}
