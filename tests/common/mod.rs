#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vision_stream::backends::{BackendLedger, ScriptedFactory};
use vision_stream::{
    BackendFactory, CopyTarget, Credentials, DecodeBackend, DeviceRegion, OpenError, StreamConfig,
    StreamSource, StreamUri, SupervisorPolicy,
};

pub const URI: &str = "rtsp://camera.test:8554/stream";

/// Fast policy for tests: millisecond backoff, no jitter.
pub fn fast_policy() -> SupervisorPolicy {
    SupervisorPolicy {
        backoff_base: Duration::from_millis(2),
        backoff_cap: Duration::from_millis(20),
        backoff_jitter: 0.0,
        poll_timeout: Duration::from_millis(20),
        ..SupervisorPolicy::default()
    }
}

pub fn source_with(
    factory: impl BackendFactory + 'static,
    policy: SupervisorPolicy,
) -> StreamSource {
    StreamSource::with_factory(StreamConfig::new(URI), policy, Box::new(factory))
        .expect("valid test uri")
}

/// Copy target over host memory. Scripted backends keep their "device" slots on the host, so
/// their frames can be inspected byte by byte.
pub struct HostCopyTarget {
    pub bytes: Vec<u8>,
}

impl HostCopyTarget {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }
}

impl CopyTarget for HostCopyTarget {
    fn device_index(&self) -> i32 {
        0
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    unsafe fn copy_from_device(&mut self, src: &DeviceRegion) -> anyhow::Result<()> {
        for row in 0..src.rows {
            let from = std::slice::from_raw_parts(
                (src.ptr as usize + row * src.pitch) as *const u8,
                src.row_bytes,
            );
            let start = row * src.row_bytes;
            self.bytes[start..start + src.row_bytes].copy_from_slice(from);
        }
        Ok(())
    }
}

/// Wraps a scripted factory and refuses every open while an outage is in effect, without
/// consuming the script.
pub struct OutageFactory {
    inner: ScriptedFactory,
    unreachable_until: Arc<Mutex<Option<Instant>>>,
}

impl OutageFactory {
    pub fn new(inner: ScriptedFactory) -> (Self, Arc<Mutex<Option<Instant>>>) {
        let switch = Arc::new(Mutex::new(None));
        (
            Self {
                inner,
                unreachable_until: Arc::clone(&switch),
            },
            switch,
        )
    }

    pub fn ledger(&self) -> Arc<BackendLedger> {
        self.inner.ledger()
    }
}

impl BackendFactory for OutageFactory {
    fn open(
        &mut self,
        uri: &StreamUri,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn DecodeBackend>, OpenError> {
        let until = *self.unreachable_until.lock().unwrap();
        if until.map_or(false, |t| Instant::now() < t) {
            return Err(OpenError::TransportUnreachable(
                "connection refused".to_string(),
            ));
        }
        self.inner.open(uri, credentials)
    }
}

/// Read until `count` frames have been delivered or `timeout` passes. Each frame is copied out
/// and summarised as `(sequence, generation, pts, first byte)`.
pub fn collect_frames(
    source: &mut StreamSource,
    count: usize,
    timeout: Duration,
) -> Vec<(u64, u64, Duration, u8)> {
    let deadline = Instant::now() + timeout;
    let mut frames = Vec::new();
    while frames.len() < count && Instant::now() < deadline {
        if let Some(frame) = source.read() {
            let summary = (
                frame.sequence(),
                frame.generation(),
                frame.pts().expect("scripted frames carry pts"),
            );
            let mut target = HostCopyTarget::new(frame.byte_len());
            frame.copy_to(&mut target).expect("host copy");
            frames.push((summary.0, summary.1, summary.2, target.bytes[0]));
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    frames
}

/// Poll until `done` holds or `timeout` passes; returns whether it held.
pub fn poll_until(
    source: &mut StreamSource,
    timeout: Duration,
    done: impl Fn(&StreamSource) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done(&*source) {
            return true;
        }
        drop(source.read());
        std::thread::sleep(Duration::from_millis(1));
    }
    done(&*source)
}
