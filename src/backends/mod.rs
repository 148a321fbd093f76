pub mod scripted;

#[cfg(feature = "rtsp-gstreamer")]
pub mod gstreamer;
#[cfg(feature = "rtsp-gstreamer")]
mod surface;

pub use scripted::{BackendLedger, Script, ScriptEvent, ScriptedFactory, Session};

#[cfg(feature = "rtsp-gstreamer")]
pub use self::gstreamer::{GstreamerBackend, PipelineSettings};

use crate::backend::{BackendFactory, DecodeBackend};
use crate::config::{Credentials, StreamConfig, StreamUri, SupervisorPolicy};
use crate::error::OpenError;

/// Picks a backend by URI scheme: `stub://` gets the synthetic camera, RTSP schemes get the
/// GStreamer pipeline when the `rtsp-gstreamer` feature is enabled.
pub struct DefaultFactory {
    stub: ScriptedFactory,
    #[cfg(feature = "rtsp-gstreamer")]
    settings: PipelineSettings,
}

impl DefaultFactory {
    pub fn new(config: &StreamConfig, policy: &SupervisorPolicy) -> Self {
        #[cfg(not(feature = "rtsp-gstreamer"))]
        let _ = policy;
        Self {
            stub: ScriptedFactory::endless().with_device_index(config.device_index),
            #[cfg(feature = "rtsp-gstreamer")]
            settings: PipelineSettings::new(config, policy),
        }
    }
}

impl BackendFactory for DefaultFactory {
    fn open(
        &mut self,
        uri: &StreamUri,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn DecodeBackend>, OpenError> {
        if uri.is_stub() {
            return self.stub.open(uri, credentials);
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            let backend = GstreamerBackend::open(uri, credentials, &self.settings)?;
            Ok(Box::new(backend))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(OpenError::HardwareUnavailable(
                "RTSP decode requires the rtsp-gstreamer feature".to_string(),
            ))
        }
    }
}
