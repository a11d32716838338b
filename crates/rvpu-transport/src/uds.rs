use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::RemoteStream;

/// Well-known rendezvous path shared by every session on a host.
pub const DEFAULT_ENDPOINT: &str = "/run/rvpu/rvpu.sock";

/// Environment variable overriding [`DEFAULT_ENDPOINT`].
pub const ENDPOINT_ENV: &str = "RVPU_ENDPOINT";

/// Resolve the rendezvous path, honouring `RVPU_ENDPOINT`.
pub fn default_endpoint() -> PathBuf {
    std::env::var_os(ENDPOINT_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENDPOINT))
}

/// Listening side of the rendezvous endpoint, owned by the engine host.
///
/// All sessions on a host share the one path; each accepted stream is one
/// channel. The socket file is removed on drop unless it was replaced.
pub struct RendezvousSocket {
    listener: UnixListener,
    path: PathBuf,
    created_inode: (u64, u64),
}

impl RendezvousSocket {
    /// Mode applied to the socket file. Group access lets a sandboxed client
    /// sharing the host group reach the engine.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o660;
    /// `sockaddr_un.sun_path` capacity.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on `path` with [`Self::DEFAULT_SOCKET_MODE`].
    ///
    /// A stale socket left at `path` by a previous host is removed first.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen on `path` with an explicit file mode.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        check_path_len(&path, Self::MAX_PATH_LEN)?;

        let bind_err = |source: std::io::Error| TransportError::Bind {
            path: path.clone(),
            source,
        };

        // Never remove anything that is not a socket.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale rendezvous socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, mode = %format!("{mode:o}"), "rendezvous endpoint listening");

        Ok(Self {
            listener,
            path,
            created_inode: (metadata.dev(), metadata.ino()),
        })
    }

    /// Block until the next client channel arrives.
    pub fn accept(&self) -> Result<RemoteStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted channel");
        Ok(RemoteStream::from_unix(stream))
    }

    /// Wait up to `timeout` for the next client channel.
    ///
    /// `Ok(None)` when nothing arrived in time or the wait was interrupted
    /// by a signal.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<RemoteStream>> {
        let mut pfd = libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: `pfd` is a valid pollfd for one entry and the listener fd
        // stays open for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(TransportError::Accept(err));
        }
        if rc == 0 {
            return Ok(None);
        }
        self.accept().map(Some)
    }

    /// Open a channel to the rendezvous endpoint at `path`.
    pub fn connect(path: impl AsRef<Path>) -> Result<RemoteStream> {
        let path = path.as_ref();
        check_path_len(path, Self::MAX_PATH_LEN)?;
        let stream = UnixStream::connect(path).map_err(|source| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?path, "connected to rendezvous endpoint");
        Ok(RemoteStream::from_unix(stream))
    }

    /// Path this endpoint is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn check_path_len(path: &Path, max: usize) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= max {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max,
        });
    }
    Ok(())
}

impl Drop for RendezvousSocket {
    fn drop(&mut self) {
        let (expected_dev, expected_ino) = self.created_inode;
        match std::fs::symlink_metadata(&self.path) {
            Ok(metadata)
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino =>
            {
                debug!(path = ?self.path, "removing rendezvous socket");
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => debug!(path = ?self.path, "rendezvous path replaced; leaving it"),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rvpu-uds-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bind_accept_connect() {
        let dir = temp_dir("roundtrip");
        let sock_path = dir.join("rvpu.sock");

        let endpoint = RendezvousSocket::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let path_clone = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut client = RendezvousSocket::connect(&path_clone).unwrap();
            client.write_all(&[0x02]).unwrap();
        });

        let mut server = endpoint.accept().unwrap();
        let mut tag = [0u8; 1];
        server.read_exact(&mut tag).unwrap();
        assert_eq!(tag[0], 0x02);
        handle.join().unwrap();

        drop(endpoint);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_too_long_is_rejected() {
        let long_path = "/tmp/".to_string() + &"v".repeat(200) + ".sock";
        assert!(matches!(
            RendezvousSocket::bind(&long_path),
            Err(TransportError::PathTooLong { .. })
        ));
        assert!(matches!(
            RendezvousSocket::connect(&long_path),
            Err(TransportError::PathTooLong { .. })
        ));
    }

    #[test]
    fn connect_without_listener_fails() {
        let dir = temp_dir("absent");
        let result = RendezvousSocket::connect(dir.join("missing.sock"));
        assert!(matches!(result, Err(TransportError::Connect { .. })));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_applies_group_mode() {
        let dir = temp_dir("mode");
        let sock_path = dir.join("mode.sock");

        let endpoint = RendezvousSocket::bind(&sock_path).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o660);

        drop(endpoint);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_replaces_stale_socket_but_not_regular_file() {
        let dir = temp_dir("stale");
        let sock_path = dir.join("stale.sock");

        let first = RendezvousSocket::bind(&sock_path).unwrap();
        std::mem::forget(first);
        let second = RendezvousSocket::bind(&sock_path).unwrap();
        drop(second);

        std::fs::write(&sock_path, b"regular-file").unwrap();
        assert!(matches!(
            RendezvousSocket::bind(&sock_path),
            Err(TransportError::Bind { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drop_keeps_replaced_path() {
        let dir = temp_dir("replaced");
        let sock_path = dir.join("replaced.sock");

        let endpoint = RendezvousSocket::bind(&sock_path).unwrap();
        std::fs::remove_file(&sock_path).unwrap();
        std::fs::write(&sock_path, b"replacement").unwrap();

        drop(endpoint);
        assert!(sock_path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn accept_timeout_returns_none_when_idle() {
        let dir = temp_dir("idle");
        let sock_path = dir.join("idle.sock");
        let endpoint = RendezvousSocket::bind(&sock_path).unwrap();

        let started = std::time::Instant::now();
        assert!(endpoint
            .accept_timeout(Duration::from_millis(30))
            .unwrap()
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));

        let _client = RendezvousSocket::connect(&sock_path).unwrap();
        assert!(endpoint
            .accept_timeout(Duration::from_millis(500))
            .unwrap()
            .is_some());

        drop(endpoint);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
