//! Error taxonomy for stream sources.
//!
//! Only `OpenError::InvalidUri` and `OpenError::InvalidPolicy` are ever returned synchronously
//! to a caller. Everything else is
//! recorded by the supervisor and observed through `StreamSource::last_error()` and the
//! liveness flag.

use thiserror::Error;

/// Failure to bring up a decode pipeline.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("invalid stream uri {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("transport unreachable: {0}")]
    TransportUnreachable(String),
    #[error("hardware decode unavailable: {0}")]
    HardwareUnavailable(String),
    #[error("invalid supervision policy: {0}")]
    InvalidPolicy(String),
}

impl OpenError {
    /// Errors that no amount of retrying will fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            OpenError::InvalidUri { .. }
                | OpenError::HardwareUnavailable(_)
                | OpenError::InvalidPolicy(_)
        )
    }
}

/// Why a running pipeline stopped producing frames.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FailureReason {
    #[error("transport dropped: {0}")]
    TransportDropped(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("remote ended the stream")]
    EndOfStream,
}

/// Caller-observable stream error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("stream failure: {0}")]
    StreamFailure(#[from] FailureReason),
    #[error("gave up after {attempts} attempts; last error: {last}")]
    PermanentFailure {
        attempts: u32,
        last: Box<StreamError>,
    },
}

impl StreamError {
    /// Timeouts are a subtype of stream failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::StreamFailure(FailureReason::Timeout(_)))
    }

    pub fn is_permanent(&self) -> bool {
        match self {
            StreamError::Open(err) => err.is_permanent(),
            StreamError::StreamFailure(_) => false,
            StreamError::PermanentFailure { .. } => true,
        }
    }
}

/// Failure to copy a frame out of its decode slot.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("frame lives on device {frame} but target is on device {target}")]
    DeviceMismatch { frame: i32, target: i32 },
    #[error("target holds {capacity} bytes, frame needs {needed}")]
    TargetTooSmall { capacity: usize, needed: usize },
    #[error("device copy failed: {0}")]
    Device(#[from] anyhow::Error),
}
