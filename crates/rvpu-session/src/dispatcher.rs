//! Engine-side receive loop.
//!
//! One [`Dispatcher`] serves one channel: it reads primitives in order and
//! routes each to the engine chosen at INIT. Nothing the peer sends and
//! nothing the engine reports ends the loop, except DEINIT and disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rvpu_frame::{FrameError, Primitive, PrimitiveCode};
use rvpu_peer::{Channel, PeerError};
use tracing::{debug, error, info, warn};

use crate::config::{
    AppliedConfig, CodecConfig, CompletionMode, PrepConfig, RcConfig, SeiMode, SessionConfig,
};
use crate::descriptor::{
    BufferDescriptor, BufferImporter, ImportedBuffer, ReadyFlag, WaitReply, WaitRequest,
    READY_SENTINEL,
};
use crate::engine::{CodecEngine, ControlCommand, EngineRegistry, Feedback, Task};
use crate::error::{EngineError, Result};

/// Attempts at draining an engine that reports [`EngineError::NotReady`].
pub const MAX_ENGINE_TRIES: u32 = 3;

/// Where the dispatcher sends WAIT replies.
pub trait Responder {
    fn respond(&mut self, code: PrimitiveCode, payload: &[u8]) -> std::result::Result<(), PeerError>;
}

impl Responder for Channel {
    fn respond(&mut self, code: PrimitiveCode, payload: &[u8]) -> std::result::Result<(), PeerError> {
        self.send(code, payload)
    }
}

/// Collects replies in memory.
impl Responder for Vec<Primitive> {
    fn respond(&mut self, code: PrimitiveCode, payload: &[u8]) -> std::result::Result<(), PeerError> {
        self.push(Primitive::new(code, payload.to_vec()));
        Ok(())
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Session settings used when INIT carries an empty payload.
    pub default_session: SessionConfig,
    pub max_engine_tries: u32,
    /// Pause between drain attempts.
    pub retry_pause: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_session: SessionConfig::default(),
            max_engine_tries: MAX_ENGINE_TRIES,
            retry_pause: Duration::from_millis(1),
        }
    }
}

/// Counters for one served channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub primitives: u64,
    /// Primitives logged and skipped.
    pub dropped: u64,
    pub engine_errors: u64,
    /// Completed WAITs.
    pub tasks: u64,
    /// True when the loop ended on DEINIT rather than disconnect.
    pub deinit: bool,
}

/// Whether the loop keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

struct ActiveSession {
    config: SessionConfig,
    engine: Box<dyn CodecEngine>,
    applied: AppliedConfig,
    task: Task,
}

/// Routes primitives from one channel to one engine.
pub struct Dispatcher {
    registry: Arc<EngineRegistry>,
    importer: Arc<dyn BufferImporter>,
    config: DispatcherConfig,
    session: Option<ActiveSession>,
    summary: DispatchSummary,
}

impl Dispatcher {
    pub fn new(registry: Arc<EngineRegistry>, importer: Arc<dyn BufferImporter>) -> Self {
        Self::with_config(registry, importer, DispatcherConfig::default())
    }

    pub fn with_config(
        registry: Arc<EngineRegistry>,
        importer: Arc<dyn BufferImporter>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            importer,
            config,
            session: None,
            summary: DispatchSummary::default(),
        }
    }

    /// Serve `channel` until DEINIT or disconnect.
    pub fn run(&mut self, channel: &mut Channel) -> Result<DispatchSummary> {
        self.run_until(channel, &AtomicBool::new(false))
    }

    /// Serve `channel` until DEINIT, disconnect, or `stop` is set.
    ///
    /// `stop` is checked between primitives, so the channel needs a receive
    /// timeout for a quiet peer not to hold the loop.
    pub fn run_until(&mut self, channel: &mut Channel, stop: &AtomicBool) -> Result<DispatchSummary> {
        loop {
            if stop.load(Ordering::SeqCst) {
                info!(channel = channel.id(), "stop requested");
                break;
            }
            let prim = match channel.recv() {
                Ok(prim) => prim,
                Err(PeerError::Timeout(_)) => continue,
                Err(PeerError::Disconnected(reason)) => {
                    info!(channel = channel.id(), %reason, "peer disconnected");
                    break;
                }
                Err(PeerError::Frame(
                    err @ (FrameError::MalformedHeader { .. }
                    | FrameError::FrameTooLarge { .. }
                    | FrameError::TruncatedFrame { .. }),
                )) => {
                    warn!(channel = channel.id(), error = %err, "dropping unreadable frame");
                    self.summary.dropped += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match self.dispatch(&prim, channel) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(PeerError::Disconnected(reason)) => {
                    info!(channel = channel.id(), %reason, "peer disconnected during reply");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(mut session) = self.session.take() {
            debug!("releasing engine of abandoned session");
            if let Err(err) = session.engine.deinit() {
                warn!(error = %err, "engine deinit failed");
            }
        }
        Ok(self.summary.clone())
    }

    /// Handle one primitive. Only reply delivery can fail.
    pub fn dispatch(
        &mut self,
        prim: &Primitive,
        out: &mut dyn Responder,
    ) -> std::result::Result<Flow, PeerError> {
        self.summary.primitives += 1;

        let Some(code) = prim.kind() else {
            warn!(code = prim.code, len = prim.len(), "unknown primitive skipped");
            self.summary.dropped += 1;
            return Ok(Flow::Continue);
        };
        debug!(%code, len = prim.len(), "dispatch");

        match code {
            PrimitiveCode::Undefined => {
                warn!("UNDEFINED primitive skipped");
                self.summary.dropped += 1;
            }
            PrimitiveCode::Init => self.on_init(&prim.payload),
            _ if self.session.is_none() => {
                warn!(%code, "primitive before INIT dropped");
                self.summary.dropped += 1;
            }
            PrimitiveCode::Deinit => {
                self.on_deinit();
                return Ok(Flow::Stop);
            }
            PrimitiveCode::Regs => self.with_engine("prepare", |s| s.engine.prepare(&s.task)),
            PrimitiveCode::Start => self.on_start(&prim.payload),
            PrimitiveCode::Wait => self.on_wait(&prim.payload, out)?,
            PrimitiveCode::ControlPrep
            | PrimitiveCode::ControlRc
            | PrimitiveCode::ControlCodec
            | PrimitiveCode::ControlSei => self.on_config(code, &prim.payload),
            PrimitiveCode::Control => {
                let command = ControlCommand::Raw(prim.payload.clone());
                self.with_engine("control", |s| s.engine.control(&command));
            }
            PrimitiveCode::Reset => self.with_engine("reset", |s| s.engine.reset()),
            PrimitiveCode::Flush => self.with_engine("flush", |s| s.engine.flush()),
        }
        Ok(Flow::Continue)
    }

    /// Configuration applied so far, once a session is initialized.
    pub fn applied(&self) -> Option<&AppliedConfig> {
        self.session.as_ref().map(|s| &s.applied)
    }

    pub fn session_config(&self) -> Option<&SessionConfig> {
        self.session.as_ref().map(|s| &s.config)
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    pub fn summary(&self) -> &DispatchSummary {
        &self.summary
    }

    fn on_init(&mut self, payload: &[u8]) {
        if self.session.is_some() {
            warn!("second INIT ignored");
            self.summary.dropped += 1;
            return;
        }

        let config = if payload.is_empty() {
            self.config.default_session.clone()
        } else {
            match SessionConfig::from_payload(payload) {
                Ok(config) => config,
                Err(err) => {
                    warn!(error = %err, "INIT with unreadable session config dropped");
                    self.summary.dropped += 1;
                    return;
                }
            }
        };

        let Some(mut engine) = self.registry.create(config.backend) else {
            error!(backend = %config.backend, "no engine registered for backend");
            self.summary.engine_errors += 1;
            return;
        };
        if let Err(err) = engine.init(&config) {
            error!(backend = %config.backend, error = %err, "engine init failed");
            self.summary.engine_errors += 1;
            return;
        }

        info!(
            backend = %config.backend,
            polling = config.completion.is_polling(),
            "session started"
        );
        self.session = Some(ActiveSession {
            applied: AppliedConfig::new(config.backend.codec()),
            config,
            engine,
            task: Task::default(),
        });
    }

    fn on_deinit(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.engine.deinit() {
                warn!(error = %err, "engine deinit failed");
                self.summary.engine_errors += 1;
            }
            info!(backend = %session.config.backend, tasks = self.summary.tasks, "session ended");
        }
        self.summary.deinit = true;
    }

    fn on_start(&mut self, payload: &[u8]) {
        let input = match self.import(payload, "START") {
            Ok(input) => input,
            Err(()) => return,
        };
        if let Some(session) = self.session.as_mut() {
            session.task.sequence += 1;
            session.task.input = input;
            session.task.output = None;
        }
        self.with_engine("start", |s| s.engine.start(&s.task));
    }

    fn on_wait(&mut self, payload: &[u8], out: &mut dyn Responder) -> std::result::Result<(), PeerError> {
        let request = if payload.is_empty() {
            None
        } else {
            match WaitRequest::decode(payload) {
                Ok(request) => Some(request),
                Err(err) => {
                    warn!(error = %err, "WAIT with unreadable descriptor dropped");
                    self.summary.dropped += 1;
                    return Ok(());
                }
            }
        };
        let tag = request.and_then(|request| request.tag);
        let output = match request {
            Some(request) => match self.import_buffer(&request.output, "WAIT") {
                Ok(buffer) => Some(buffer),
                Err(()) => return self.reply_failed(tag, out),
            },
            None => None,
        };

        let tries = self.config.max_engine_tries.max(1);
        let pause = self.config.retry_pause;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.task.output = output;

        let mut outcome = Err(EngineError::NotReady);
        for attempt in 1..=tries {
            outcome = session.engine.wait(&session.task);
            match &outcome {
                Err(EngineError::NotReady) if attempt < tries => thread::sleep(pause),
                _ => break,
            }
        }

        let feedback = match outcome {
            Ok(feedback) => feedback,
            Err(err) => {
                warn!(sequence = session.task.sequence, error = %err, "engine wait failed");
                session.task.output = None;
                self.summary.engine_errors += 1;
                return self.reply_failed(tag, out);
            }
        };
        session.applied.clear_changes();
        self.summary.tasks += 1;
        debug!(
            sequence = session.task.sequence,
            output_size = feedback.output_size,
            "task complete"
        );

        let output = session.task.output.take();
        match session.config.completion {
            CompletionMode::RoundTrip { .. } => {
                let reply = WaitReply::done(reply_descriptor(output.as_ref(), &feedback), tag);
                out.respond(PrimitiveCode::Wait, &reply.encode())?;
            }
            CompletionMode::Polling { .. } => {
                if let Some(region) = output.as_ref().and_then(ImportedBuffer::region) {
                    let published = u32::try_from(feedback.output_size)
                        .unwrap_or(READY_SENTINEL - 1)
                        .min(READY_SENTINEL - 1);
                    region.publish(published);
                }
            }
        }
        Ok(())
    }

    /// Tell a round-trip client its WAIT failed. Polling clients time out.
    fn reply_failed(&self, tag: Option<u64>, out: &mut dyn Responder) -> std::result::Result<(), PeerError> {
        match self.session.as_ref().map(|s| s.config.completion) {
            Some(CompletionMode::RoundTrip { .. }) => {
                out.respond(PrimitiveCode::Wait, &WaitReply::failed(tag).encode())
            }
            _ => Ok(()),
        }
    }

    fn on_config(&mut self, code: PrimitiveCode, payload: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let codec = session.config.backend.codec();
        let expected = match code {
            PrimitiveCode::ControlPrep => PrepConfig::SIZE,
            PrimitiveCode::ControlRc => RcConfig::SIZE,
            PrimitiveCode::ControlCodec => codec.record_size(),
            _ => SeiMode::SIZE,
        };
        if payload.len() != expected {
            warn!(%code, expected, got = payload.len(), "config size mismatch, dropped");
            self.summary.dropped += 1;
            return;
        }

        let applied = &mut session.applied;
        let command = match code {
            PrimitiveCode::ControlPrep => PrepConfig::decode(payload).map(|prep| {
                applied.prep.merge_from(&prep);
                ControlCommand::Prep(prep)
            }),
            PrimitiveCode::ControlRc => RcConfig::decode(payload).map(|rc| {
                let change = applied.rc.change | rc.change;
                applied.rc = RcConfig { change, ..rc };
                ControlCommand::Rc(rc)
            }),
            PrimitiveCode::ControlCodec => CodecConfig::decode(codec, payload).and_then(|record| {
                applied.codec.merge_from(&record)?;
                Ok(ControlCommand::Codec(record))
            }),
            _ => SeiMode::decode(payload).map(|sei| {
                applied.sei = sei;
                ControlCommand::Sei(sei)
            }),
        };

        match command {
            Ok(command) => self.with_engine("control", |s| s.engine.control(&command)),
            Err(err) => {
                warn!(%code, error = %err, "config record dropped");
                self.summary.dropped += 1;
            }
        }
    }

    /// Decode and import a descriptor payload; empty means no buffer.
    fn import(&mut self, payload: &[u8], op: &'static str) -> std::result::Result<Option<ImportedBuffer>, ()> {
        if payload.is_empty() {
            return Ok(None);
        }
        match BufferDescriptor::decode(payload) {
            Ok(desc) => self.import_buffer(&desc, op).map(Some),
            Err(err) => {
                warn!(op, error = %err, "unreadable descriptor, primitive dropped");
                self.summary.dropped += 1;
                Err(())
            }
        }
    }

    fn import_buffer(&mut self, desc: &BufferDescriptor, op: &'static str) -> std::result::Result<ImportedBuffer, ()> {
        match self.importer.import_descriptor(desc) {
            Ok(buffer) => Ok(buffer),
            Err(err) => {
                warn!(op, error = %err, "buffer import failed, primitive dropped");
                self.summary.dropped += 1;
                Err(())
            }
        }
    }

    fn with_engine<F>(&mut self, op: &'static str, call: F)
    where
        F: FnOnce(&mut ActiveSession) -> std::result::Result<(), EngineError>,
    {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(err) = call(session) {
            warn!(op, error = %err, "engine operation failed");
            self.summary.engine_errors += 1;
        }
    }
}

fn reply_descriptor(output: Option<&ImportedBuffer>, feedback: &Feedback) -> BufferDescriptor {
    output
        .map(|buffer| buffer.descriptor)
        .unwrap_or_else(|| BufferDescriptor::heap(0))
        .with_size(feedback.output_size as u64)
}
