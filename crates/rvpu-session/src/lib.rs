//! Remote VPU sessions.
//!
//! The client half ([`RemoteSession`]) proxies codec calls over a channel;
//! the engine half ([`Dispatcher`]) serves them against a [`CodecEngine`]
//! picked from an [`EngineRegistry`].

pub mod client;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod waiter;

pub use client::{RemoteSession, SessionState, TaskOutput};
pub use config::{
    AppliedConfig, BackendKind, ChangeMask, CodecConfig, CodecKind, CompletionMode, ConfigRequest,
    ConfigSet, H264Change, H264Config, JpegChange, JpegConfig, PrepChange, PrepConfig, RcConfig,
    SeiMode, SessionConfig,
};
pub use descriptor::{
    BufferDescriptor, BufferImporter, BufferKind, HandleTable, ImportedBuffer, ReadyFlag,
    SharedRegion, WaitReply, WaitRequest, READY_SENTINEL,
};
pub use dispatcher::{
    DispatchSummary, Dispatcher, DispatcherConfig, Flow, Responder, MAX_ENGINE_TRIES,
};
pub use engine::{
    CodecEngine, ControlCommand, EngineRegistry, Feedback, PassthroughEngine, Task, TaskStatus,
};
pub use error::{ConfigError, DescriptorError, EngineError, Result, SessionError};
pub use waiter::{await_reply, poll_ready_flag, wait_for_completion, Completion};
