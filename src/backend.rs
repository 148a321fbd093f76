use crate::config::{Credentials, StreamUri};
use crate::error::{FailureReason, OpenError};
use crate::frame::DeviceBuffer;

/// Lifecycle of one decode pipeline instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Running,
    Stopped,
    Faulted,
}

/// Outcome of a single non-blocking (or bounded-wait) poll.
///
/// `NoFrameYet` is not an error: the pipeline is alive but nothing completed this tick.
#[derive(Debug)]
pub enum FramePoll {
    Frame(DeviceBuffer),
    NoFrameYet,
    StreamEnded,
    Failed(FailureReason),
}

/// One running hardware decode pipeline bound to one stream.
///
/// Driven by a single reader. Implementations must:
/// - never block in `poll_frame` longer than the poll timeout they were opened with
/// - never recycle a buffer slot while a `DeviceBuffer` for it is alive
/// - release every decoder and socket resource in `close`, even after a failure
pub trait DecodeBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn state(&self) -> PipelineState;

    fn poll_frame(&mut self) -> FramePoll;

    /// Tear the pipeline down. Idempotent.
    fn close(&mut self);
}

/// Creates pipelines. Called once per (re)connect attempt.
pub trait BackendFactory: Send {
    fn open(
        &mut self,
        uri: &StreamUri,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn DecodeBackend>, OpenError>;
}
