//! RTSP decode pipeline on GStreamer.
//!
//! ```text
//! rtspsrc ! decodebin ! cudaconvert    ! video/x-raw(memory:CUDAMemory),format=BGRA ! appsink
//!                       nvvideoconvert ! video/x-raw(memory:NVMM),format=RGBA
//! ```
//!
//! rtspsrc only exposes the first H.264/H.265 video stream; audio and metadata streams are
//! refused in `select-stream`. The appsink keeps a single buffer and drops older ones, so a
//! slow reader always gets the newest picture and the decoder never stalls on us.
//!
//! Frames stay in device memory. A caps negotiation that lands in system memory is reported
//! as a decode failure rather than silently copied.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::time::Duration;

use crate::backend::{DecodeBackend, FramePoll, PipelineState};
use crate::config::{Credentials, DecoderFlavor, StreamConfig, StreamUri, SupervisorPolicy};
use crate::error::{FailureReason, OpenError};
use crate::frame::{DeviceBuffer, FrameGeometry, PixelLayout};

use super::surface;

/// Jitterbuffer latency handed to rtspsrc, in milliseconds.
const RTSP_LATENCY_MS: u32 = 100;
const ACCEPTED_ENCODINGS: &[&str] = &["H264", "H265"];
/// `GST_MAP_FLAG_LAST << 1`: asks the CUDA allocator for the device pointer on map.
const GST_MAP_CUDA: u32 = 1 << 17;

/// Settings shared by every pipeline a factory opens.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub flavor: DecoderFlavor,
    pub device_index: i32,
    pub connect_timeout: Duration,
    pub poll_timeout: Duration,
}

impl PipelineSettings {
    pub fn new(config: &StreamConfig, policy: &SupervisorPolicy) -> Self {
        Self {
            flavor: config.flavor,
            device_index: config.device_index,
            connect_timeout: policy.connect_timeout,
            poll_timeout: policy.poll_timeout,
        }
    }
}

fn converter_element(flavor: DecoderFlavor) -> &'static str {
    match flavor {
        DecoderFlavor::Cuda => "cudaconvert",
        DecoderFlavor::DeepStream => "nvvideoconvert",
    }
}

fn memory_feature(flavor: DecoderFlavor) -> &'static str {
    match flavor {
        DecoderFlavor::Cuda => "memory:CUDAMemory",
        DecoderFlavor::DeepStream => "memory:NVMM",
    }
}

fn output_layout(flavor: DecoderFlavor) -> (PixelLayout, &'static str) {
    match flavor {
        DecoderFlavor::Cuda => (PixelLayout::Bgra, "BGRA"),
        DecoderFlavor::DeepStream => (PixelLayout::Rgba, "RGBA"),
    }
}

pub struct GstreamerBackend {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    flavor: DecoderFlavor,
    device_index: i32,
    poll_timeout: Duration,
    sequence: u64,
    state: PipelineState,
    closed: bool,
}

impl GstreamerBackend {
    /// Build the pipeline and set it playing. Returns once the state change is issued; the
    /// RTSP handshake completes asynchronously and surfaces through `poll_frame`.
    pub fn open(
        uri: &StreamUri,
        credentials: Option<&Credentials>,
        settings: &PipelineSettings,
    ) -> Result<Self, OpenError> {
        gst::init()
            .map_err(|e| OpenError::HardwareUnavailable(format!("initialize gstreamer: {}", e)))?;

        let converter_name = converter_element(settings.flavor);
        for name in ["rtspsrc", "decodebin", converter_name, "capsfilter", "appsink"] {
            if gst::ElementFactory::find(name).is_none() {
                return Err(OpenError::HardwareUnavailable(format!(
                    "gstreamer element {} is not installed",
                    name
                )));
            }
        }

        let pipeline = gst::Pipeline::builder().name("vision-stream").build();
        let src = make_element("rtspsrc")?;
        let decodebin = make_element("decodebin")?;
        let convert = make_element(converter_name)?;
        let capsfilter = make_element("capsfilter")?;

        configure_rtspsrc(&src, uri, credentials, settings.connect_timeout);
        configure_converter(&convert, settings.flavor, settings.device_index);

        let (_, format) = output_layout(settings.flavor);
        let caps = gst::Caps::builder("video/x-raw")
            .features([memory_feature(settings.flavor)])
            .field("format", format)
            .build();
        capsfilter.set_property("caps", &caps);

        let appsink = gst_app::AppSink::builder()
            .max_buffers(1)
            .drop(true)
            .sync(false)
            .build();

        pipeline
            .add_many([&src, &decodebin, &convert, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| build_error("add elements", e))?;
        gst::Element::link_many([&convert, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| build_error("link converter", e))?;

        let decodebin_weak = decodebin.downgrade();
        src.connect_pad_added(move |_, pad| {
            if let Some(decodebin) = decodebin_weak.upgrade() {
                if pad_matches(pad, is_supported_rtp) {
                    link_pad(pad, &decodebin);
                }
            }
        });
        let convert_weak = convert.downgrade();
        decodebin.connect_pad_added(move |_, pad| {
            if let Some(convert) = convert_weak.upgrade() {
                if pad_matches(pad, |s| s.name().as_str().starts_with("video/")) {
                    link_pad(pad, &convert);
                }
            }
        });

        pipeline.set_state(gst::State::Playing).map_err(|e| {
            let _ = pipeline.set_state(gst::State::Null);
            OpenError::TransportUnreachable(format!("start pipeline for {}: {}", uri, e))
        })?;
        log::info!(
            "gstreamer pipeline playing for {} ({})",
            uri,
            converter_name
        );

        Ok(Self {
            pipeline,
            appsink,
            flavor: settings.flavor,
            device_index: settings.device_index,
            poll_timeout: settings.poll_timeout,
            sequence: 0,
            state: PipelineState::Running,
            closed: false,
        })
    }

    /// Drain pending bus messages. Errors and EOS end the pipeline.
    fn poll_bus(&mut self) -> Option<FramePoll> {
        let bus = self.pipeline.bus()?;
        while let Some(message) = bus.pop() {
            use gst::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    let source = err
                        .src()
                        .map(|s| s.path_string().to_string())
                        .unwrap_or_else(|| "pipeline".to_string());
                    self.state = PipelineState::Faulted;
                    return Some(FramePoll::Failed(classify_error(&source, &err.error())));
                }
                MessageView::Eos(..) => {
                    self.state = PipelineState::Stopped;
                    return Some(FramePoll::StreamEnded);
                }
                MessageView::Warning(warning) => {
                    log::warn!("gstreamer warning: {}", warning.error());
                }
                _ => {}
            }
        }
        None
    }

    fn sample_to_buffer(&mut self, sample: gst::Sample) -> Result<DeviceBuffer, FailureReason> {
        let caps = sample
            .caps()
            .ok_or_else(|| FailureReason::Decode("sample has no caps".to_string()))?;
        let feature = memory_feature(self.flavor);
        if !caps.features(0).map_or(false, |f| f.contains(feature)) {
            return Err(FailureReason::Decode(format!(
                "pipeline negotiated {} instead of {}",
                caps, feature
            )));
        }
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| FailureReason::Decode(format!("parse video caps: {}", e)))?;
        let (layout, _) = output_layout(self.flavor);
        let buffer = sample
            .buffer_owned()
            .ok_or_else(|| FailureReason::Decode("sample has no buffer".to_string()))?;
        let pts = buffer.pts().map(|t| Duration::from_nanos(t.nseconds()));
        self.sequence += 1;

        match self.flavor {
            DecoderFlavor::Cuda => {
                let geometry = FrameGeometry::new(
                    info.width() as usize,
                    info.height() as usize,
                    layout,
                    info.stride()[0] as usize,
                )?;
                let mapping = CudaMapping::map(buffer)?;
                Ok(DeviceBuffer::new(
                    geometry,
                    mapping.device_ptr(),
                    self.device_index,
                    self.sequence,
                    pts,
                    Box::new(mapping),
                ))
            }
            DecoderFlavor::DeepStream => {
                let view = {
                    let map = buffer
                        .map_readable()
                        .map_err(|e| FailureReason::Decode(format!("map NVMM buffer: {}", e)))?;
                    // SAFETY: caps carry memory:NVMM, so the mapped bytes are an NvBufSurface.
                    unsafe { surface::first_surface(map.as_slice()) }
                        .map_err(FailureReason::Decode)?
                };
                let geometry = FrameGeometry::new(
                    view.width as usize,
                    view.height as usize,
                    layout,
                    view.pitch as usize,
                )?;
                Ok(DeviceBuffer::new(
                    geometry,
                    view.data_ptr,
                    view.gpu_id as i32,
                    self.sequence,
                    pts,
                    Box::new(buffer),
                ))
            }
        }
    }
}

impl DecodeBackend for GstreamerBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    fn poll_frame(&mut self) -> FramePoll {
        if self.state != PipelineState::Running {
            return FramePoll::Failed(FailureReason::TransportDropped(
                "pipeline is not running".to_string(),
            ));
        }
        if let Some(outcome) = self.poll_bus() {
            return outcome;
        }

        let timeout = gst::ClockTime::from_nseconds(
            u64::try_from(self.poll_timeout.as_nanos()).unwrap_or(u64::MAX),
        );
        match self.appsink.try_pull_sample(timeout) {
            Some(sample) => match self.sample_to_buffer(sample) {
                Ok(buffer) => FramePoll::Frame(buffer),
                Err(reason) => {
                    self.state = PipelineState::Faulted;
                    FramePoll::Failed(reason)
                }
            },
            None if self.appsink.is_eos() => {
                self.state = PipelineState::Stopped;
                FramePoll::StreamEnded
            }
            None => FramePoll::NoFrameYet,
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = PipelineState::Stopped;
        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("failed to stop gstreamer pipeline: {}", err);
        }
    }
}

impl Drop for GstreamerBackend {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// CUDA memory mapping
// ----------------------------------------------------------------------------

/// A buffer mapped with `GST_MAP_CUDA`. Keeps the buffer, and with it the pool slot, alive
/// until dropped.
struct CudaMapping {
    buffer: gst::Buffer,
    info: gst::ffi::GstMapInfo,
}

// SAFETY: the map info only holds pointers into `buffer`, which is itself Send. The mapping
// is unmapped exactly once, on drop, by whichever thread owns it.
unsafe impl Send for CudaMapping {}

impl CudaMapping {
    fn map(buffer: gst::Buffer) -> Result<Self, FailureReason> {
        let mut info = std::mem::MaybeUninit::<gst::ffi::GstMapInfo>::zeroed();
        // SAFETY: `buffer` is a valid, owned GstBuffer and `info` is writable.
        let mapped = unsafe {
            gst::ffi::gst_buffer_map(
                buffer.as_mut_ptr(),
                info.as_mut_ptr(),
                gst::ffi::GST_MAP_READ | GST_MAP_CUDA,
            )
        };
        if mapped == 0 {
            return Err(FailureReason::Decode(
                "buffer does not map as CUDA memory".to_string(),
            ));
        }
        // SAFETY: gst_buffer_map filled `info` on success.
        let info = unsafe { info.assume_init() };
        if info.data.is_null() {
            let mut info = info;
            unsafe { gst::ffi::gst_buffer_unmap(buffer.as_mut_ptr(), &mut info) };
            return Err(FailureReason::Decode("CUDA map returned null".to_string()));
        }
        Ok(Self { buffer, info })
    }

    fn device_ptr(&self) -> u64 {
        self.info.data as u64
    }
}

impl Drop for CudaMapping {
    fn drop(&mut self) {
        // SAFETY: `info` came from a successful gst_buffer_map on `buffer`.
        unsafe { gst::ffi::gst_buffer_unmap(self.buffer.as_mut_ptr(), &mut self.info) };
    }
}

// ----------------------------------------------------------------------------
// Pipeline helpers
// ----------------------------------------------------------------------------

fn make_element(name: &str) -> Result<gst::Element, OpenError> {
    gst::ElementFactory::make(name).build().map_err(|e| {
        OpenError::HardwareUnavailable(format!("create gstreamer element {}: {}", name, e))
    })
}

fn build_error(step: &str, err: impl std::fmt::Display) -> OpenError {
    OpenError::HardwareUnavailable(format!("build pipeline ({}): {}", step, err))
}

fn configure_rtspsrc(
    src: &gst::Element,
    uri: &StreamUri,
    credentials: Option<&Credentials>,
    connect_timeout: Duration,
) {
    let timeout_us = u64::try_from(connect_timeout.as_micros()).unwrap_or(u64::MAX);
    src.set_property("location", uri.as_str());
    src.set_property("latency", RTSP_LATENCY_MS);
    src.set_property("drop-on-latency", true);
    src.set_property("tcp-timeout", timeout_us);
    src.set_property("timeout", timeout_us);
    if let Some(creds) = credentials {
        src.set_property("user-id", creds.username.as_str());
        if let Some(password) = creds.password.as_deref() {
            src.set_property("user-pw", password);
        }
    }
    src.connect("select-stream", false, |values| {
        let keep = values
            .get(2)
            .and_then(|v| v.get::<gst::Caps>().ok())
            .and_then(|caps| caps.structure(0).map(is_supported_rtp))
            .unwrap_or(false);
        Some(keep.to_value())
    });
}

fn configure_converter(convert: &gst::Element, flavor: DecoderFlavor, device_index: i32) {
    match flavor {
        DecoderFlavor::Cuda => {
            if convert.find_property("cuda-device-id").is_some() {
                convert.set_property("cuda-device-id", device_index);
            }
        }
        DecoderFlavor::DeepStream => {
            if convert.find_property("gpu-id").is_some() {
                convert.set_property("gpu-id", device_index.max(0) as u32);
            }
        }
    }
}

fn is_supported_rtp(structure: &gst::StructureRef) -> bool {
    structure.name().as_str() == "application/x-rtp"
        && structure.get::<&str>("media").ok() == Some("video")
        && structure
            .get::<&str>("encoding-name")
            .map_or(false, |enc| ACCEPTED_ENCODINGS.contains(&enc))
}

fn pad_matches(pad: &gst::Pad, accept: impl Fn(&gst::StructureRef) -> bool) -> bool {
    let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
    caps.structure(0).map_or(false, accept)
}

fn link_pad(src_pad: &gst::Pad, sink: &gst::Element) {
    let Some(sink_pad) = sink.static_pad("sink") else {
        log::warn!("{} has no sink pad", sink.name());
        return;
    };
    if sink_pad.is_linked() {
        log::debug!("{} already linked, ignoring pad {}", sink.name(), src_pad.name());
        return;
    }
    match src_pad.link(&sink_pad) {
        Ok(_) => log::debug!("linked pad {} to {}", src_pad.name(), sink.name()),
        Err(err) => log::error!("failed to link pad {} to {}: {:?}", src_pad.name(), sink.name(), err),
    }
}

/// Map a bus error to a failure reason. Decoder errors are decode failures; everything
/// upstream of decodebin is transport.
fn classify_error(source: &str, err: &gst::glib::Error) -> FailureReason {
    let message = format!("{}: {}", source, err);
    if err.matches(gst::StreamError::Decode)
        || err.matches(gst::StreamError::Format)
        || err.matches(gst::StreamError::CodecNotFound)
    {
        FailureReason::Decode(message)
    } else {
        FailureReason::TransportDropped(message)
    }
}
