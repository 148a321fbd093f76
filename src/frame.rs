//! Device-resident frame handles.
//!
//! - `DeviceBuffer`: a decoded picture sitting in a backend buffer slot. Holding it keeps the
//!   slot reserved; dropping it hands the slot back to the backend.
//! - `DeviceFrame`: what `StreamSource::read` gives to callers. It borrows the source, so it
//!   cannot outlive the next `read()`, and its bytes leave only through `copy_to`.
//! - `CopyTarget`: caller-owned device memory a frame is copied into.
//!
//! Pixels are always 8 bits per channel. There is no `Clone`, no `AsRef<[u8]>` and no host
//! mapping on any of these types.

use std::marker::PhantomData;
use std::time::Duration;

use crate::error::{CopyError, FailureReason};

/// Raw device address, as used by CUDA driver APIs.
pub type DevicePtr = u64;

/// Channel order of an 8-bit interleaved picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    Rgb,
    Bgr,
    Rgba,
    Bgra,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Rgb | PixelLayout::Bgr => 3,
            PixelLayout::Rgba | PixelLayout::Bgra => 4,
        }
    }
}

/// Shape of a decoded picture. Constructed only through `FrameGeometry::new`, which rejects
/// empty pictures and pitches shorter than a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    width: usize,
    height: usize,
    layout: PixelLayout,
    pitch: usize,
}

impl FrameGeometry {
    pub fn new(
        width: usize,
        height: usize,
        layout: PixelLayout,
        pitch: usize,
    ) -> Result<Self, FailureReason> {
        if width == 0 || height == 0 {
            return Err(FailureReason::Decode(format!(
                "empty picture {}x{}",
                width, height
            )));
        }
        let row_bytes = width * layout.channels();
        if pitch < row_bytes {
            return Err(FailureReason::Decode(format!(
                "pitch {} shorter than row of {} bytes",
                pitch, row_bytes
            )));
        }
        Ok(Self {
            width,
            height,
            layout,
            pitch,
        })
    }

    /// Geometry with rows packed back to back.
    pub fn packed(width: usize, height: usize, layout: PixelLayout) -> Result<Self, FailureReason> {
        Self::new(width, height, layout, width * layout.channels())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    pub fn row_bytes(&self) -> usize {
        self.width * self.channels()
    }

    /// Bytes of pixel data once copied out densely: `height * width * channels`.
    pub fn packed_len(&self) -> usize {
        self.row_bytes() * self.height
    }
}

/// A pitched region of device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceRegion {
    pub ptr: DevicePtr,
    pub device_index: i32,
    pub pitch: usize,
    pub row_bytes: usize,
    pub rows: usize,
}

impl DeviceRegion {
    pub fn packed_len(&self) -> usize {
        self.row_bytes * self.rows
    }

    pub fn is_packed(&self) -> bool {
        self.pitch == self.row_bytes
    }
}

// ----------------------------------------------------------------------------
// DeviceBuffer: a backend slot lease
// ----------------------------------------------------------------------------

/// Decoded picture in a backend buffer slot.
///
/// The `hold` keeps the slot reserved (a pipeline sample, a pool lease). The backend never
/// recycles a slot while its `DeviceBuffer` is alive.
pub struct DeviceBuffer {
    geometry: FrameGeometry,
    ptr: DevicePtr,
    device_index: i32,
    sequence: u64,
    pts: Option<Duration>,
    generation: u64,
    _hold: Box<dyn Send>,
}

impl DeviceBuffer {
    pub fn new(
        geometry: FrameGeometry,
        ptr: DevicePtr,
        device_index: i32,
        sequence: u64,
        pts: Option<Duration>,
        hold: Box<dyn Send>,
    ) -> Self {
        Self {
            geometry,
            ptr,
            device_index,
            sequence,
            pts,
            generation: 0,
            _hold: hold,
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn device_index(&self) -> i32 {
        self.device_index
    }

    /// Capture index assigned by the backend; strictly increasing within one pipeline.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn pts(&self) -> Option<Duration> {
        self.pts
    }

    /// Pipeline instance that produced this buffer. Set by the supervisor.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn stamp(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn region(&self) -> DeviceRegion {
        DeviceRegion {
            ptr: self.ptr,
            device_index: self.device_index,
            pitch: self.geometry.pitch(),
            row_bytes: self.geometry.row_bytes(),
            rows: self.geometry.height(),
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("geometry", &self.geometry)
            .field("device_index", &self.device_index)
            .field("sequence", &self.sequence)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// DeviceFrame: caller-facing, valid for one read-to-copy cycle
// ----------------------------------------------------------------------------

/// A decoded frame in device memory, handed out by `StreamSource::read`.
///
/// The frame mutably borrows its source, so the next `read()` cannot happen while it is
/// alive. Copy it out with [`DeviceFrame::copy_to`] or drop it; either way the backing slot is
/// released.
pub struct DeviceFrame<'a> {
    buffer: DeviceBuffer,
    _source: PhantomData<&'a mut ()>,
}

impl<'a> DeviceFrame<'a> {
    pub(crate) fn new(buffer: DeviceBuffer) -> Self {
        Self {
            buffer,
            _source: PhantomData,
        }
    }

    pub fn width(&self) -> usize {
        self.buffer.geometry.width()
    }

    pub fn height(&self) -> usize {
        self.buffer.geometry.height()
    }

    pub fn channels(&self) -> usize {
        self.buffer.geometry.channels()
    }

    pub fn layout(&self) -> PixelLayout {
        self.buffer.geometry.layout()
    }

    /// Tensor shape, `(height, width, channels)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height(), self.width(), self.channels())
    }

    pub fn device_index(&self) -> i32 {
        self.buffer.device_index
    }

    /// Device address of the first row. Valid only while this frame is alive.
    pub fn device_ptr(&self) -> DevicePtr {
        self.buffer.ptr
    }

    pub fn pitch(&self) -> usize {
        self.buffer.geometry.pitch()
    }

    /// Size of the densely packed copy: `height * width * channels`.
    pub fn byte_len(&self) -> usize {
        self.buffer.geometry.packed_len()
    }

    pub fn sequence(&self) -> u64 {
        self.buffer.sequence
    }

    pub fn pts(&self) -> Option<Duration> {
        self.buffer.pts
    }

    pub fn generation(&self) -> u64 {
        self.buffer.generation
    }

    /// Device-to-device copy into caller-owned storage. Consumes the frame, so the slot is
    /// released as soon as the copy completes.
    pub fn copy_to<T: CopyTarget + ?Sized>(self, target: &mut T) -> Result<(), CopyError> {
        let region = self.buffer.region();
        if target.device_index() != region.device_index {
            return Err(CopyError::DeviceMismatch {
                frame: region.device_index,
                target: target.device_index(),
            });
        }
        let needed = region.packed_len();
        if target.capacity() < needed {
            return Err(CopyError::TargetTooSmall {
                capacity: target.capacity(),
                needed,
            });
        }
        // SAFETY: `self.buffer` holds the slot for the duration of the call, so the region is
        // valid device memory of `rows * pitch` bytes.
        unsafe { target.copy_from_device(&region)? };
        Ok(())
    }
}

impl std::fmt::Debug for DeviceFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceFrame").field(&self.buffer).finish()
    }
}

/// Caller-owned device memory that frames are copied into.
pub trait CopyTarget {
    fn device_index(&self) -> i32;

    /// Usable bytes at the destination.
    fn capacity(&self) -> usize;

    /// Copy `src.rows` rows of `src.row_bytes` bytes, packing them densely.
    ///
    /// # Safety
    ///
    /// `src` must describe memory that stays valid on `src.device_index` for the whole call.
    unsafe fn copy_from_device(&mut self, src: &DeviceRegion) -> anyhow::Result<()>;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropProbe(Arc<AtomicUsize>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingTarget {
        device: i32,
        capacity: usize,
        copied: Option<DeviceRegion>,
    }

    impl CopyTarget for RecordingTarget {
        fn device_index(&self) -> i32 {
            self.device
        }

        fn capacity(&self) -> usize {
            self.capacity
        }

        unsafe fn copy_from_device(&mut self, src: &DeviceRegion) -> anyhow::Result<()> {
            self.copied = Some(*src);
            Ok(())
        }
    }

    fn make_buffer(released: &Arc<AtomicUsize>) -> DeviceBuffer {
        let geometry = FrameGeometry::new(4, 2, PixelLayout::Bgra, 32).unwrap();
        DeviceBuffer::new(
            geometry,
            0xdead_0000,
            1,
            7,
            Some(Duration::from_millis(40)),
            Box::new(DropProbe(released.clone())),
        )
    }

    #[test]
    fn geometry_rejects_empty_and_short_pitch() {
        assert!(FrameGeometry::new(0, 10, PixelLayout::Bgr, 0).is_err());
        assert!(FrameGeometry::new(10, 10, PixelLayout::Bgr, 29).is_err());
        let g = FrameGeometry::new(10, 10, PixelLayout::Bgr, 32).unwrap();
        assert_eq!(g.row_bytes(), 30);
        assert_eq!(g.packed_len(), 300);
    }

    #[test]
    fn frame_reports_shape_and_packed_length() {
        let released = Arc::new(AtomicUsize::new(0));
        let frame = DeviceFrame::new(make_buffer(&released));
        assert_eq!(frame.shape(), (2, 4, 4));
        assert_eq!(frame.byte_len(), 32);
        assert_eq!(frame.pitch(), 32);
        assert_eq!(frame.device_index(), 1);
        assert_eq!(frame.sequence(), 7);
    }

    #[test]
    fn copy_out_consumes_frame_and_releases_slot() {
        let released = Arc::new(AtomicUsize::new(0));
        let frame = DeviceFrame::new(make_buffer(&released));
        let mut target = RecordingTarget {
            device: 1,
            capacity: 32,
            copied: None,
        };
        frame.copy_to(&mut target).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        let region = target.copied.unwrap();
        assert_eq!(region.ptr, 0xdead_0000);
        assert_eq!(region.packed_len(), 32);
    }

    #[test]
    fn copy_out_checks_device_and_capacity() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut wrong_device = RecordingTarget {
            device: 0,
            capacity: 64,
            copied: None,
        };
        let err = DeviceFrame::new(make_buffer(&released))
            .copy_to(&mut wrong_device)
            .unwrap_err();
        assert!(matches!(err, CopyError::DeviceMismatch { frame: 1, target: 0 }));

        let mut too_small = RecordingTarget {
            device: 1,
            capacity: 16,
            copied: None,
        };
        let err = DeviceFrame::new(make_buffer(&released))
            .copy_to(&mut too_small)
            .unwrap_err();
        assert!(matches!(err, CopyError::TargetTooSmall { needed: 32, .. }));
        // Failed copies still release their slots.
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_frame_without_copy_releases_slot() {
        let released = Arc::new(AtomicUsize::new(0));
        drop(DeviceFrame::new(make_buffer(&released)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
