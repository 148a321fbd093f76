//! CUDA tensor storage for copied-out frames.
//!
//! `CudaTensorBuffer` is a dense `(height, width, channels)` u8 allocation on one device,
//! filled with device-to-device copies. It is what a downstream tensor library wraps.

use anyhow::{Context, Result};
use cudarc::driver::{result, CudaDevice, CudaSlice, DevicePtr, DeviceSlice};
use std::sync::Arc;

use crate::frame::{CopyTarget, DeviceFrame, DeviceRegion};

pub struct CudaTensorBuffer {
    device: Arc<CudaDevice>,
    storage: CudaSlice<u8>,
    shape: (usize, usize, usize),
    device_index: i32,
}

impl CudaTensorBuffer {
    pub fn new(device_index: i32, shape: (usize, usize, usize)) -> Result<Self> {
        let ordinal = usize::try_from(device_index)
            .with_context(|| format!("invalid CUDA device index {}", device_index))?;
        let device = CudaDevice::new(ordinal)
            .with_context(|| format!("open CUDA device {}", device_index))?;
        let (height, width, channels) = shape;
        let storage = device
            .alloc_zeros::<u8>(height * width * channels)
            .context("allocate tensor storage")?;
        Ok(Self {
            device,
            storage,
            shape,
            device_index,
        })
    }

    /// Storage sized and placed for `frame`.
    pub fn for_frame(frame: &DeviceFrame<'_>) -> Result<Self> {
        Self::new(frame.device_index(), frame.shape())
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn device_ptr(&self) -> u64 {
        *self.storage.device_ptr()
    }

    pub fn storage(&self) -> &CudaSlice<u8> {
        &self.storage
    }

    /// Copy the tensor back to the host. Blocking; meant for inspection and tests.
    pub fn to_host(&self) -> Result<Vec<u8>> {
        self.device
            .dtoh_sync_copy(&self.storage)
            .context("copy tensor to host")
    }
}

impl CopyTarget for CudaTensorBuffer {
    fn device_index(&self) -> i32 {
        self.device_index
    }

    fn capacity(&self) -> usize {
        self.storage.len()
    }

    unsafe fn copy_from_device(&mut self, src: &DeviceRegion) -> Result<()> {
        self.device
            .bind_to_thread()
            .context("bind CUDA context")?;
        let dst = *self.storage.device_ptr();
        if src.is_packed() {
            result::memcpy_dtod_sync(dst, src.ptr, src.packed_len())
                .context("device-to-device copy")?;
            return Ok(());
        }
        for row in 0..src.rows {
            let dst_row = dst + (row * src.row_bytes) as u64;
            let src_row = src.ptr + (row * src.pitch) as u64;
            result::memcpy_dtod_sync(dst_row, src_row, src.row_bytes)
                .with_context(|| format!("device-to-device copy of row {}", row))?;
        }
        Ok(())
    }
}
