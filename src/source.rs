//! Caller-facing stream source.
//!
//! `StreamSource` owns a `ConnectionSupervisor` and hands out frames through `read()`. It is
//! driven by a single reader: every method except `liveness()` takes `&self`/`&mut self` on
//! the owning thread, and the returned `LivenessHandle` is the only piece meant to cross
//! threads.

use crate::backend::BackendFactory;
use crate::backends::DefaultFactory;
use crate::config::{StreamConfig, StreamUri, SupervisorPolicy};
use crate::error::{OpenError, StreamError};
use crate::frame::DeviceFrame;
use crate::supervisor::{ConnectionState, ConnectionSupervisor, LivenessHandle, StreamStats};

/// A supervised, hardware-decoded video stream.
///
/// Construction never touches the network. The first `read()` issues the first connection
/// attempt; from then on the source reconnects by itself until closed, dropped, or out of
/// retries.
///
/// A frame borrows the source until it is copied out or dropped, so frames cannot pile up
/// in decoder slots:
///
/// ```compile_fail
/// use vision_stream::{StreamConfig, StreamSource};
///
/// let mut source = StreamSource::new(StreamConfig::new("stub://cam")).unwrap();
/// let first = source.read();
/// let second = source.read(); // `first` still borrows `source`
/// drop((first, second));
/// ```
///
/// Dropping (or copying out) the frame first is fine:
///
/// ```
/// use vision_stream::{StreamConfig, StreamSource};
///
/// let mut source = StreamSource::new(StreamConfig::new("stub://cam")).unwrap();
/// if let Some(frame) = source.read() {
///     assert_eq!(frame.shape(), (480, 640, 3));
/// }
/// assert!(source.read().is_some());
/// assert!(!source.is_reconnecting());
/// ```
pub struct StreamSource {
    supervisor: ConnectionSupervisor,
}

impl StreamSource {
    /// Source with the default supervision policy.
    ///
    /// Fails only for a malformed or unsupported URI, or a policy that does not validate.
    /// Unreachable cameras and missing decoders are reported later through
    /// `is_reconnecting()`, `is_failed()` and `last_error()`.
    pub fn new(config: StreamConfig) -> Result<Self, OpenError> {
        Self::with_policy(config, SupervisorPolicy::default())
    }

    pub fn with_policy(config: StreamConfig, policy: SupervisorPolicy) -> Result<Self, OpenError> {
        let factory = DefaultFactory::new(&config, &policy);
        Self::with_factory(config, policy, Box::new(factory))
    }

    /// Source backed by a custom pipeline factory.
    pub fn with_factory(
        config: StreamConfig,
        policy: SupervisorPolicy,
        factory: Box<dyn BackendFactory>,
    ) -> Result<Self, OpenError> {
        let uri = StreamUri::parse(&config.uri)?;
        policy
            .validate()
            .map_err(|err| OpenError::InvalidPolicy(format!("{:#}", err)))?;
        log::debug!("stream source created for {}", uri);
        Ok(Self {
            supervisor: ConnectionSupervisor::new(uri, config.credentials, factory, policy),
        })
    }

    /// Newest decoded frame, or `None` if nothing is ready.
    ///
    /// Never blocks beyond the policy's poll timeout, whether the stream is live,
    /// reconnecting, or permanently failed.
    pub fn read(&mut self) -> Option<DeviceFrame<'_>> {
        self.supervisor.poll().map(DeviceFrame::new)
    }

    /// True whenever the stream is not live: before the first frame, while reconnecting,
    /// and after a permanent failure.
    pub fn is_reconnecting(&self) -> bool {
        self.supervisor.is_reconnecting()
    }

    /// True once the source has stopped retrying.
    pub fn is_failed(&self) -> bool {
        self.state() == ConnectionState::PermanentlyFailed
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Most recent failure, kept across reconnects until replaced.
    pub fn last_error(&self) -> Option<&StreamError> {
        self.supervisor.last_error()
    }

    pub fn liveness(&self) -> LivenessHandle {
        self.supervisor.liveness()
    }

    pub fn stats(&self) -> StreamStats {
        self.supervisor.stats()
    }

    /// Tear down the pipeline and stop reconnecting. Idempotent.
    pub fn close(&mut self) {
        self.supervisor.close();
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}
