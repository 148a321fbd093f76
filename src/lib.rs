//! Vision Stream
//!
//! Resilient RTSP ingestion that hands hardware-decoded frames to the caller in device memory.
//!
//! # Architecture
//!
//! A source is built from three layers:
//!
//! 1. **Decode backend** (`backend`, `backends`): one pipeline instance. It produces frames
//!    into a bounded pool of device slots and reports failures as values.
//! 2. **Connection supervisor** (`supervisor`): owns the backend, tears it down and rebuilds it
//!    with capped exponential backoff, and discards buffers from stale pipelines.
//! 3. **Stream source** (`source`): the caller API. `read()` never blocks beyond the poll
//!    timeout, and frames borrow the source until copied out (`frame`).
//!
//! Frames never touch host memory. The only way out is a device-to-device copy into a
//! caller-owned `CopyTarget`, for example `CudaTensorBuffer` with the `cuda` feature.
//!
//! # Module Structure
//!
//! - `config`: URIs, credentials, supervision policy, file and environment loading
//! - `error`: open, stream and copy error types
//! - `frame`: `DeviceFrame`, `DeviceBuffer`, `CopyTarget`
//! - `backends`: scripted/synthetic backend and, behind `rtsp-gstreamer`, the GStreamer pipeline

pub mod backend;
pub mod backends;
pub mod config;
pub mod error;
pub mod frame;
pub mod source;
pub mod supervisor;

#[cfg(feature = "cuda")]
pub mod adapter;

#[cfg(feature = "cuda")]
pub use adapter::CudaTensorBuffer;
pub use backend::{BackendFactory, DecodeBackend, FramePoll, PipelineState};
pub use config::{
    Credentials, DecoderFlavor, EndOfStreamPolicy, StreamConfig, StreamSettings, StreamUri,
    SupervisorPolicy,
};
pub use error::{CopyError, FailureReason, OpenError, StreamError};
pub use frame::{CopyTarget, DeviceBuffer, DeviceFrame, DeviceRegion, FrameGeometry, PixelLayout};
pub use source::StreamSource;
pub use supervisor::{Backoff, ConnectionState, LivenessHandle, StreamStats};
