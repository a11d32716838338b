//! Completion waiting for a submitted task.
//!
//! A session waits one of two ways, fixed by its [`CompletionMode`]: a WAIT
//! reply on the channel, or a ready-flag word polled in shared memory. Both
//! bound the wait; running out of time is [`Completion::Timeout`], not an
//! error.
//!
//! Round-trip WAITs carry a tag the engine host echoes, so a reply that
//! arrives after its deadline is recognised and skipped by the next wait.

use std::thread;
use std::time::{Duration, Instant};

use rvpu_frame::PrimitiveCode;
use rvpu_peer::{Channel, PeerError};
use tracing::{debug, warn};

use crate::config::CompletionMode;
use crate::descriptor::{ReadyFlag, WaitReply, READY_SENTINEL};
use crate::engine::TaskStatus;

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Output byte count reported by the engine host.
    Ready(usize),
    /// The engine host reported that the task failed.
    Failed,
    Timeout,
}

impl Completion {
    pub fn len(&self) -> usize {
        match self {
            Completion::Ready(len) => *len,
            Completion::Failed | Completion::Timeout => 0,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Completion::Timeout)
    }
}

/// Poll `flag` until it leaves the sentinel, at most `max_polls` times.
///
/// The flag must have been armed before the request went out.
pub fn poll_ready_flag(flag: &dyn ReadyFlag, interval: Duration, max_polls: u32) -> Completion {
    for poll in 0..max_polls {
        let value = flag.load();
        if value != READY_SENTINEL {
            debug!(polls = poll, len = value, "ready flag published");
            return Completion::Ready(value as usize);
        }
        thread::sleep(interval);
    }

    let value = flag.load();
    if value != READY_SENTINEL {
        return Completion::Ready(value as usize);
    }
    debug!(max_polls, "ready flag not published");
    Completion::Timeout
}

/// Block for the WAIT reply tagged `tag` until `timeout` elapses.
///
/// Other primitives, and replies tagged for an earlier WAIT, are logged and
/// skipped. An untagged reply is accepted. The channel's previous receive
/// timeout is restored before returning.
pub fn await_reply(
    channel: &mut Channel,
    timeout: Duration,
    tag: Option<u64>,
) -> Result<Completion, PeerError> {
    let previous = channel.recv_timeout();
    let result = await_reply_inner(channel, timeout, tag);
    channel.set_recv_timeout(previous)?;
    result
}

fn await_reply_inner(
    channel: &mut Channel,
    timeout: Duration,
    tag: Option<u64>,
) -> Result<Completion, PeerError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Completion::Timeout);
        }
        channel.set_recv_timeout(Some(remaining))?;

        let prim = match channel.recv() {
            Ok(prim) => prim,
            Err(PeerError::Timeout(_)) => return Ok(Completion::Timeout),
            Err(err) => return Err(err),
        };

        if prim.kind() != Some(PrimitiveCode::Wait) {
            warn!(name = prim.name(), code = prim.code, "skipping primitive while awaiting WAIT reply");
            continue;
        }

        let reply = match WaitReply::decode(&prim.payload) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "WAIT reply with unreadable descriptor");
                continue;
            }
        };
        if let (Some(want), Some(got)) = (tag, reply.tag) {
            if want != got {
                debug!(want, got, "skipping stale WAIT reply");
                continue;
            }
        }
        return Ok(match reply.status {
            TaskStatus::Done => Completion::Ready(reply.output.size as usize),
            TaskStatus::Failed => Completion::Failed,
        });
    }
}

/// Wait according to `mode`. `flag` is only consulted in polling mode,
/// `tag` only in round-trip mode.
pub fn wait_for_completion(
    mode: &CompletionMode,
    channel: &mut Channel,
    flag: Option<&dyn ReadyFlag>,
    tag: Option<u64>,
) -> Result<Completion, PeerError> {
    match (*mode, flag) {
        (CompletionMode::RoundTrip { timeout_ms }, _) => {
            await_reply(channel, Duration::from_millis(timeout_ms), tag)
        }
        (
            CompletionMode::Polling {
                interval_ms,
                max_polls,
            },
            Some(flag),
        ) => Ok(poll_ready_flag(
            flag,
            Duration::from_millis(interval_ms),
            max_polls,
        )),
        (CompletionMode::Polling { .. }, None) => Ok(Completion::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use super::*;
    use crate::descriptor::BufferDescriptor;

    #[test]
    fn poll_sees_published_value() {
        let flag = Arc::new(AtomicU32::new(0));
        flag.arm();

        let producer = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            producer.publish(321);
        });

        let started = Instant::now();
        let completion = poll_ready_flag(&*flag, Duration::from_millis(1), 50);
        handle.join().unwrap();

        assert_eq!(completion, Completion::Ready(321));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn poll_times_out_when_never_published() {
        let flag = AtomicU32::new(0);
        flag.arm();

        let started = Instant::now();
        let completion = poll_ready_flag(&flag, Duration::from_millis(1), 50);
        assert_eq!(completion, Completion::Timeout);
        assert_eq!(completion.len(), 0);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn zero_length_completion_is_ready() {
        let flag = AtomicU32::new(0);
        flag.arm();
        flag.publish(0);
        assert_eq!(
            poll_ready_flag(&flag, Duration::from_millis(1), 1),
            Completion::Ready(0)
        );
    }

    #[test]
    fn reply_skips_other_primitives() {
        let (mut client, mut server) = Channel::pair().unwrap();
        server.send(PrimitiveCode::Flush, b"").unwrap();
        server
            .send(
                PrimitiveCode::Wait,
                &BufferDescriptor::heap(0).with_size(1234).encode(),
            )
            .unwrap();

        let completion = await_reply(&mut client, Duration::from_millis(500), None).unwrap();
        assert_eq!(completion, Completion::Ready(1234));
        assert_eq!(client.recv_timeout(), None);
    }

    #[test]
    fn reply_deadline_is_timeout() {
        let (mut client, _server) = Channel::pair().unwrap();
        let started = Instant::now();
        let completion = await_reply(&mut client, Duration::from_millis(50), Some(1)).unwrap();
        assert!(completion.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn reply_on_closed_channel_is_error() {
        let (mut client, server) = Channel::pair().unwrap();
        server.shutdown();
        drop(server);
        assert!(matches!(
            await_reply(&mut client, Duration::from_millis(50), None),
            Err(PeerError::Disconnected(_))
        ));
    }

    #[test]
    fn polling_without_flag_is_timeout() {
        let (mut client, _server) = Channel::pair().unwrap();
        let completion =
            wait_for_completion(&CompletionMode::polling(), &mut client, None, None).unwrap();
        assert!(completion.is_timeout());
    }

    #[test]
    fn reply_with_earlier_tag_is_skipped() {
        let (mut client, mut server) = Channel::pair().unwrap();
        let late = WaitReply::done(BufferDescriptor::heap(0).with_size(111), Some(1));
        let current = WaitReply::done(BufferDescriptor::heap(0).with_size(222), Some(2));
        server.send(PrimitiveCode::Wait, &late.encode()).unwrap();
        server.send(PrimitiveCode::Wait, &current.encode()).unwrap();

        let completion = await_reply(&mut client, Duration::from_millis(500), Some(2)).unwrap();
        assert_eq!(completion, Completion::Ready(222));
    }

    #[test]
    fn failed_reply_is_failed_completion() {
        let (mut client, mut server) = Channel::pair().unwrap();
        server
            .send(PrimitiveCode::Wait, &WaitReply::failed(Some(7)).encode())
            .unwrap();

        let completion = await_reply(&mut client, Duration::from_millis(500), Some(7)).unwrap();
        assert_eq!(completion, Completion::Failed);
        assert_eq!(completion.len(), 0);
        assert!(!completion.is_timeout());
    }
}
