//! Backend codec engine contract and registry.
//!
//! The dispatcher picks one engine per session at INIT, by [`BackendKind`],
//! and drives it through [`CodecEngine`]. Completion is reported by the value
//! `wait` returns.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tracing::debug;

use crate::config::{BackendKind, CodecConfig, PrepConfig, RcConfig, SeiMode, SessionConfig};
use crate::descriptor::ImportedBuffer;
use crate::error::EngineError;

/// Buffers of one encode or decode job.
#[derive(Debug, Clone, Default)]
pub struct Task {
    /// Monotonic per-session job counter.
    pub sequence: u64,
    pub input: Option<ImportedBuffer>,
    pub output: Option<ImportedBuffer>,
}

/// Outcome of a completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Done,
    Failed,
}

/// Per-task result, produced once per completed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feedback {
    pub status: TaskStatus,
    pub output_size: usize,
    /// Produced bit count.
    pub result_detail: u64,
}

impl Feedback {
    pub fn done(output_size: usize) -> Self {
        Self {
            status: TaskStatus::Done,
            output_size,
            result_detail: output_size as u64 * 8,
        }
    }

    pub fn failed() -> Self {
        Self {
            status: TaskStatus::Failed,
            output_size: 0,
            result_detail: 0,
        }
    }
}

/// Configuration or raw command forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Prep(PrepConfig),
    Rc(RcConfig),
    Codec(CodecConfig),
    Sei(SeiMode),
    /// Payload of a generic CONTROL primitive, uninterpreted.
    Raw(Bytes),
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Prep(_) => "prep",
            ControlCommand::Rc(_) => "rc",
            ControlCommand::Codec(_) => "codec",
            ControlCommand::Sei(_) => "sei",
            ControlCommand::Raw(_) => "raw",
        }
    }
}

/// A hardware or software codec backend as seen by the dispatcher.
pub trait CodecEngine: Send {
    fn init(&mut self, config: &SessionConfig) -> Result<(), EngineError>;
    fn deinit(&mut self) -> Result<(), EngineError>;
    /// Generate per-frame parameters for the next task.
    fn prepare(&mut self, task: &Task) -> Result<(), EngineError>;
    fn start(&mut self, task: &Task) -> Result<(), EngineError>;
    /// Drain the started task. [`EngineError::NotReady`] asks the caller to
    /// try again shortly.
    fn wait(&mut self, task: &Task) -> Result<Feedback, EngineError>;
    fn reset(&mut self) -> Result<(), EngineError>;
    fn flush(&mut self) -> Result<(), EngineError>;
    fn control(&mut self, command: &ControlCommand) -> Result<(), EngineError>;
}

type EngineFactory = Box<dyn Fn() -> Box<dyn CodecEngine> + Send + Sync>;

/// Engine constructors keyed by backend kind.
#[derive(Default)]
pub struct EngineRegistry {
    factories: HashMap<BackendKind, EngineFactory>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry serving every backend kind with [`PassthroughEngine`].
    pub fn with_passthrough() -> Self {
        let mut registry = Self::new();
        for kind in BackendKind::ALL {
            registry.register(kind, || Box::new(PassthroughEngine::default()));
        }
        registry
    }

    pub fn register<F>(&mut self, kind: BackendKind, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn CodecEngine> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
        self
    }

    /// Construct a fresh engine, `None` when the kind has no factory.
    pub fn create(&self, kind: BackendKind) -> Option<Box<dyn CodecEngine>> {
        let engine = self.factories.get(&kind).map(|factory| factory());
        debug!(backend = %kind, found = engine.is_some(), "engine lookup");
        engine
    }

    pub fn supports(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.name());
        kinds
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Demo engine that copies the input buffer to the output buffer.
///
/// With a shared input region the region's bytes are copied; with a heap
/// input only its size is known and the output is that many zero bytes.
#[derive(Debug, Default)]
pub struct PassthroughEngine {
    initialized: bool,
    pending: Option<Vec<u8>>,
    controls: Vec<ControlCommand>,
}

impl PassthroughEngine {
    /// Commands received so far.
    pub fn controls(&self) -> &[ControlCommand] {
        &self.controls
    }

    fn ensure_init(&self) -> Result<(), EngineError> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }
}

impl CodecEngine for PassthroughEngine {
    fn init(&mut self, config: &SessionConfig) -> Result<(), EngineError> {
        debug!(backend = %config.backend, "passthrough engine init");
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), EngineError> {
        self.initialized = false;
        self.pending = None;
        Ok(())
    }

    fn prepare(&mut self, _task: &Task) -> Result<(), EngineError> {
        self.ensure_init()
    }

    fn start(&mut self, task: &Task) -> Result<(), EngineError> {
        self.ensure_init()?;
        let bytes = match &task.input {
            Some(input) => match input.region() {
                Some(region) => {
                    let mut data = region.read();
                    data.truncate(input.size());
                    data
                }
                None => vec![0u8; input.size()],
            },
            None => Vec::new(),
        };
        self.pending = Some(bytes);
        Ok(())
    }

    fn wait(&mut self, task: &Task) -> Result<Feedback, EngineError> {
        self.ensure_init()?;
        let mut bytes = self.pending.take().ok_or(EngineError::NotReady)?;

        if let Some(output) = &task.output {
            bytes.truncate(output.size());
            if let Some(region) = output.region() {
                region
                    .write(&bytes)
                    .map_err(|err| EngineError::Failed(err.to_string()))?;
            }
        }
        Ok(Feedback::done(bytes.len()))
    }

    fn reset(&mut self) -> Result<(), EngineError> {
        self.pending = None;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EngineError> {
        self.pending = None;
        Ok(())
    }

    fn control(&mut self, command: &ControlCommand) -> Result<(), EngineError> {
        self.ensure_init()?;
        self.controls.push(command.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::descriptor::{BufferDescriptor, SharedRegion};

    fn shared(region: &Arc<SharedRegion>, size: u64) -> ImportedBuffer {
        ImportedBuffer::attached(region.descriptor().with_size(size), Arc::clone(region))
    }

    #[test]
    fn passthrough_copies_shared_input() {
        let input = Arc::new(SharedRegion::new(1, 64));
        let output = Arc::new(SharedRegion::new(2, 64));
        input.write(b"raw-frame").unwrap();

        let mut engine = PassthroughEngine::default();
        engine.init(&SessionConfig::default()).unwrap();

        let task = Task {
            sequence: 1,
            input: Some(shared(&input, 9)),
            output: Some(shared(&output, 64)),
        };
        engine.start(&task).unwrap();
        let feedback = engine.wait(&task).unwrap();

        assert_eq!(feedback, Feedback::done(9));
        assert_eq!(feedback.result_detail, 72);
        assert_eq!(output.read(), b"raw-frame");
    }

    #[test]
    fn wait_without_start_is_not_ready() {
        let mut engine = PassthroughEngine::default();
        engine.init(&SessionConfig::default()).unwrap();
        assert_eq!(
            engine.wait(&Task::default()).unwrap_err(),
            EngineError::NotReady
        );
    }

    #[test]
    fn output_truncated_to_capacity() {
        let mut engine = PassthroughEngine::default();
        engine.init(&SessionConfig::default()).unwrap();
        let task = Task {
            sequence: 1,
            input: Some(ImportedBuffer::detached(BufferDescriptor::heap(100))),
            output: Some(ImportedBuffer::detached(BufferDescriptor::heap(40))),
        };
        engine.start(&task).unwrap();
        assert_eq!(engine.wait(&task).unwrap().output_size, 40);
    }

    #[test]
    fn uninitialized_engine_refuses_work() {
        let mut engine = PassthroughEngine::default();
        assert_eq!(
            engine.start(&Task::default()).unwrap_err(),
            EngineError::NotInitialized
        );
    }

    #[test]
    fn registry_creates_by_kind() {
        let mut registry = EngineRegistry::new();
        registry.register(BackendKind::JpegEncoder, || {
            Box::new(PassthroughEngine::default())
        });
        assert!(registry.create(BackendKind::JpegEncoder).is_some());
        assert!(registry.create(BackendKind::H264Decoder).is_none());
        assert_eq!(registry.kinds(), vec![BackendKind::JpegEncoder]);

        let all = EngineRegistry::with_passthrough();
        assert!(BackendKind::ALL.iter().all(|kind| all.supports(*kind)));
    }
}
