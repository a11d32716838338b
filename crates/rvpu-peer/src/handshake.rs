use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{PeerError, Result};

/// Channel-type tag announcing a remote VPU session.
pub const CHANNEL_TAG_RVPU: u8 = 0x02;

/// Answer sent instead of an echo when the offered tag is not served.
pub const TAG_REJECT: u8 = 0xFF;

/// Configuration for the one-byte channel handshake.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange.
    pub timeout: Duration,
    /// Tag the client offers.
    pub tag: u8,
    /// Tags the server echoes; anything else is answered with [`TAG_REJECT`].
    pub accepted_tags: Vec<u8>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            tag: CHANNEL_TAG_RVPU,
            accepted_tags: vec![CHANNEL_TAG_RVPU],
        }
    }
}

/// Client half: send the channel tag and expect it echoed.
///
/// The stream's read timeout must already be set for the deadline to apply.
pub fn handshake_client<S: Read + Write>(stream: &mut S, config: &HandshakeConfig) -> Result<u8> {
    write_tag(stream, config.tag)?;

    let deadline = Instant::now() + config.timeout;
    let got = read_tag(stream, deadline, config.timeout)?;
    if got != config.tag {
        return Err(PeerError::HandshakeMismatch {
            expected: config.tag,
            got,
        });
    }

    debug!(tag = got, "channel handshake complete");
    Ok(got)
}

/// Server half: read the offered tag, echo it when accepted, reject otherwise.
pub fn handshake_server<S: Read + Write>(stream: &mut S, config: &HandshakeConfig) -> Result<u8> {
    let deadline = Instant::now() + config.timeout;
    let offered = read_tag(stream, deadline, config.timeout)?;

    if !config.accepted_tags.contains(&offered) {
        warn!(tag = offered, "rejecting channel with unsupported tag");
        if let Err(err) = write_tag(stream, TAG_REJECT) {
            debug!(tag = offered, error = %err, "reject answer not delivered");
        }
        return Err(PeerError::UnsupportedTag(offered));
    }

    write_tag(stream, offered)?;
    debug!(tag = offered, "channel handshake accepted");
    Ok(offered)
}

fn write_tag<W: Write>(stream: &mut W, tag: u8) -> Result<()> {
    loop {
        match stream.write(&[tag]) {
            Ok(0) => {
                return Err(PeerError::Disconnected(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(_) => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(PeerError::Frame(err.into())),
        }
    }
    stream
        .flush()
        .map_err(|err| PeerError::Frame(err.into()))
}

fn read_tag<R: Read>(stream: &mut R, deadline: Instant, timeout: Duration) -> Result<u8> {
    let mut tag = [0u8; 1];
    loop {
        if Instant::now() >= deadline {
            return Err(PeerError::Timeout(timeout));
        }

        match stream.read(&mut tag) {
            Ok(0) => {
                return Err(PeerError::Disconnected(
                    "connection closed during handshake".to_string(),
                ))
            }
            Ok(_) => return Ok(tag[0]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(PeerError::Frame(err.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;

    #[test]
    fn successful_handshake() {
        let (mut left, mut right) = UnixStream::pair().unwrap();

        let server =
            thread::spawn(move || handshake_server(&mut left, &HandshakeConfig::default()).unwrap());

        let client = handshake_client(&mut right, &HandshakeConfig::default()).unwrap();
        assert_eq!(client, CHANNEL_TAG_RVPU);
        assert_eq!(server.join().unwrap(), CHANNEL_TAG_RVPU);
    }

    #[test]
    fn unsupported_tag_is_rejected() {
        let (mut left, mut right) = UnixStream::pair().unwrap();

        let server = thread::spawn(move || handshake_server(&mut left, &HandshakeConfig::default()));

        let cfg = HandshakeConfig {
            tag: 0x07,
            ..HandshakeConfig::default()
        };
        let result = handshake_client(&mut right, &cfg);
        assert!(matches!(
            result,
            Err(PeerError::HandshakeMismatch {
                expected: 0x07,
                got: TAG_REJECT
            })
        ));
        assert!(matches!(
            server.join().unwrap(),
            Err(PeerError::UnsupportedTag(0x07))
        ));
    }

    #[test]
    fn wrong_echo_is_mismatch() {
        let mut stream = ScriptedStream::new(&[0x03]);
        let result = handshake_client(&mut stream, &HandshakeConfig::default());
        assert!(matches!(
            result,
            Err(PeerError::HandshakeMismatch {
                expected: CHANNEL_TAG_RVPU,
                got: 0x03
            })
        ));
        assert_eq!(stream.written, vec![CHANNEL_TAG_RVPU]);
    }

    #[test]
    fn closed_peer_is_disconnected() {
        let mut stream = ScriptedStream::new(&[]);
        let result = handshake_client(&mut stream, &HandshakeConfig::default());
        assert!(matches!(result, Err(PeerError::Disconnected(_))));
    }

    #[test]
    fn handshake_timeout() {
        let mut stream = AlwaysTimedOut;
        let cfg = HandshakeConfig {
            timeout: Duration::from_millis(25),
            ..HandshakeConfig::default()
        };
        let result = handshake_client(&mut stream, &cfg);
        assert!(matches!(result, Err(PeerError::Timeout(_))));
    }

    #[test]
    fn server_accepts_extra_tags() {
        let mut stream = ScriptedStream::new(&[0x05]);
        let cfg = HandshakeConfig {
            accepted_tags: vec![CHANNEL_TAG_RVPU, 0x05],
            ..HandshakeConfig::default()
        };
        assert_eq!(handshake_server(&mut stream, &cfg).unwrap(), 0x05);
        assert_eq!(stream.written, vec![0x05]);
    }

    #[test]
    fn rejection_survives_closed_writer() {
        let mut stream = HalfClosed(Cursor::new(vec![0x09]));
        let result = handshake_server(&mut stream, &HandshakeConfig::default());
        assert!(matches!(result, Err(PeerError::UnsupportedTag(0x09))));
    }

    /// Readable, but every write fails as if the peer hung up.
    struct HalfClosed(Cursor<Vec<u8>>);

    impl Read for HalfClosed {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for HalfClosed {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(input: &[u8]) -> Self {
            Self {
                input: Cursor::new(input.to_vec()),
                written: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct AlwaysTimedOut;

    impl Read for AlwaysTimedOut {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            thread::sleep(Duration::from_millis(5));
            Err(std::io::Error::from(ErrorKind::TimedOut))
        }
    }

    impl Write for AlwaysTimedOut {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
