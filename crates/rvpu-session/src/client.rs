//! Client side of a remote VPU session.
//!
//! [`RemoteSession`] turns codec framework calls into primitives on one
//! channel and enforces the call order
//! `init → control* → (regs? → start → wait)* → reset/flush → deinit`.

use std::fmt;
use std::path::Path;

use rvpu_frame::PrimitiveCode;
use rvpu_peer::{connect_with_config, Channel, ConnectConfig, PeerError};
use tracing::{debug, info, warn};

use crate::config::{change_primitive, ChangeMask, ConfigRequest, ConfigSet, SessionConfig};
use crate::descriptor::{BufferDescriptor, ReadyFlag, WaitRequest};
use crate::engine::{Feedback, TaskStatus};
use crate::error::{Result, SessionError};
use crate::waiter::{wait_for_completion, Completion};

/// Lifecycle of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Connected,
    Configured,
    Running,
    Waiting,
    Resetting,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connected => "connected",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Waiting => "waiting",
            SessionState::Resetting => "resetting",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Result of one `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutput {
    /// Output byte count; zero on timeout or failure.
    pub length: usize,
    pub feedback: Feedback,
    pub timed_out: bool,
}

impl TaskOutput {
    fn from_completion(completion: Completion) -> Self {
        let feedback = match completion {
            Completion::Failed => Feedback::failed(),
            _ => Feedback::done(completion.len()),
        };
        Self {
            length: completion.len(),
            feedback,
            timed_out: completion.is_timeout(),
        }
    }

    fn empty() -> Self {
        Self {
            length: 0,
            feedback: Feedback::done(0),
            timed_out: false,
        }
    }
}

/// One codec session proxied to a remote engine host.
#[derive(Debug)]
pub struct RemoteSession {
    config: SessionConfig,
    state: SessionState,
    channel: Option<Channel>,
    configs: ConfigSet,
    wait_tag: u64,
}

impl RemoteSession {
    pub fn new(config: SessionConfig) -> Self {
        let configs = ConfigSet::new(config.backend.codec());
        Self {
            config,
            state: SessionState::Uninitialized,
            channel: None,
            configs,
            wait_tag: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Configuration records recorded but not yet delivered.
    pub fn pending(&self) -> ChangeMask {
        self.configs.pending()
    }

    /// Connect to `endpoint` and send INIT.
    pub fn init(&mut self, endpoint: impl AsRef<Path>) -> Result<()> {
        self.init_with_config(&ConnectConfig::for_endpoint(endpoint))
    }

    pub fn init_with_config(&mut self, connect: &ConnectConfig) -> Result<()> {
        self.expect_state("init", &[SessionState::Uninitialized, SessionState::Disconnected])?;
        let channel = connect_with_config(connect)?;
        self.attach(channel)
    }

    /// Start the session over an already-connected channel.
    pub fn attach(&mut self, mut channel: Channel) -> Result<()> {
        self.expect_state("attach", &[SessionState::Uninitialized, SessionState::Disconnected])?;

        let payload = self
            .config
            .to_payload()
            .map_err(|err| SessionError::Allocation(err.to_string()))?;
        channel.send(PrimitiveCode::Init, &payload)?;

        info!(
            channel = channel.id(),
            backend = %self.config.backend,
            polling = self.config.completion.is_polling(),
            "session initialized"
        );
        self.channel = Some(channel);
        self.state = SessionState::Connected;
        Ok(())
    }

    /// Record a configuration change and deliver every pending record.
    ///
    /// Records the backend does not consume are logged and ignored.
    pub fn control(&mut self, request: ConfigRequest) -> Result<()> {
        self.expect_state("control", &[SessionState::Connected, SessionState::Configured])?;

        let bit = request.change_bit();
        if !self.config.backend.accepted_changes().contains(bit) {
            warn!(backend = %self.config.backend, change = ?bit, "control ignored by backend");
            return Ok(());
        }
        if let ConfigRequest::Prep(prep) = &request {
            prep.validate(self.config.backend)?;
        }

        self.configs.record(request)?;
        self.sync_pending()?;
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Ask the engine to generate per-frame parameters.
    pub fn gen_regs(&mut self) -> Result<()> {
        self.expect_state("gen_regs", &[SessionState::Connected, SessionState::Configured])?;
        self.send(PrimitiveCode::Regs, &[])
    }

    /// Submit one task. Shared inputs travel as a sanitized descriptor; heap
    /// inputs as an empty START.
    pub fn start(&mut self, input: &BufferDescriptor) -> Result<()> {
        self.expect_state(
            "start",
            &[
                SessionState::Connected,
                SessionState::Configured,
                SessionState::Waiting,
            ],
        )?;
        self.sync_pending()?;

        if input.is_shared() {
            self.send(PrimitiveCode::Start, &input.encode())?;
        } else {
            self.send(PrimitiveCode::Start, &[])?;
        }
        self.state = SessionState::Running;
        Ok(())
    }

    /// Wait for the submitted task.
    ///
    /// In polling mode `ready` is armed before WAIT goes out; a heap output or
    /// a missing flag sends an empty WAIT and returns zero length at once.
    pub fn wait(&mut self, output: &BufferDescriptor, ready: Option<&dyn ReadyFlag>) -> Result<TaskOutput> {
        self.expect_state("wait", &[SessionState::Running])?;
        self.state = SessionState::Waiting;

        let mode = self.config.completion;
        let result = if mode.is_polling() {
            match ready {
                Some(flag) if output.is_shared() => {
                    flag.arm();
                    self.send(PrimitiveCode::Wait, &output.encode())?;
                    self.complete(Some(flag), None)?
                }
                _ => {
                    self.send(PrimitiveCode::Wait, &[])?;
                    TaskOutput::empty()
                }
            }
        } else {
            self.wait_tag = self.wait_tag.wrapping_add(1).max(1);
            let tag = self.wait_tag;
            self.send(PrimitiveCode::Wait, &WaitRequest::tagged(*output, tag).encode())?;
            self.complete(None, Some(tag))?
        };

        if result.timed_out {
            debug!("task completion timed out");
        } else if result.feedback.status == TaskStatus::Failed {
            warn!("engine host reported task failure");
        }
        self.state = SessionState::Configured;
        Ok(result)
    }

    /// Abort in-flight work.
    pub fn reset(&mut self) -> Result<()> {
        self.interrupt("reset", PrimitiveCode::Reset)
    }

    /// Drop queued work.
    pub fn flush(&mut self) -> Result<()> {
        self.interrupt("flush", PrimitiveCode::Flush)
    }

    /// End the session: DEINIT best effort, then close the channel.
    pub fn deinit(&mut self) -> Result<()> {
        self.expect_connected("deinit")?;
        if let Some(channel) = self.channel.take() {
            info!(channel = channel.id(), "session closing");
            channel.disconnect();
        }
        self.state = SessionState::Disconnected;
        Ok(())
    }

    fn interrupt(&mut self, op: &'static str, code: PrimitiveCode) -> Result<()> {
        self.expect_connected(op)?;
        self.state = SessionState::Resetting;
        self.send(code, &[])?;
        self.state = SessionState::Configured;
        Ok(())
    }

    fn complete(&mut self, flag: Option<&dyn ReadyFlag>, tag: Option<u64>) -> Result<TaskOutput> {
        let mode = self.config.completion;
        let channel = self.channel_mut("wait")?;
        match wait_for_completion(&mode, channel, flag, tag) {
            Ok(completion) => Ok(TaskOutput::from_completion(completion)),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Deliver pending records in PREP, RC, CODEC, SEI order. A bit is
    /// cleared only once its record was sent.
    fn sync_pending(&mut self) -> Result<()> {
        for bit in self.configs.pending().iter() {
            let Some(code) = change_primitive(bit) else {
                continue;
            };
            let payload = self.configs.encoded(bit);
            self.send(code, &payload)?;
            self.configs.clear(bit);
        }
        Ok(())
    }

    fn send(&mut self, code: PrimitiveCode, payload: &[u8]) -> Result<()> {
        let channel = self.channel_mut(code.name())?;
        match channel.send(code, payload) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&mut self, err: PeerError) -> SessionError {
        if err.is_fatal() {
            warn!(error = %err, "channel failed; session disconnected");
            if let Some(channel) = self.channel.take() {
                channel.shutdown();
            }
            self.state = SessionState::Disconnected;
        }
        SessionError::Connection(err)
    }

    fn channel_mut(&mut self, op: &'static str) -> Result<&mut Channel> {
        let state = self.state;
        self.channel
            .as_mut()
            .ok_or(SessionError::InvalidState { op, state })
    }

    fn expect_state(&self, op: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn expect_connected(&self, op: &'static str) -> Result<()> {
        match self.state {
            SessionState::Uninitialized | SessionState::Disconnected => {
                Err(SessionError::InvalidState {
                    op,
                    state: self.state,
                })
            }
            _ => Ok(()),
        }
    }
}
