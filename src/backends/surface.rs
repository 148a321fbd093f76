//! Leading fields of DeepStream's `NvBufSurface` and `NvBufSurfaceParams`.
//!
//! Only the prefix is mirrored. The structs are read through pointers into mapped NVMM
//! buffers and never constructed or indexed past element zero, so the trailing fields do not
//! need to match.

use std::os::raw::{c_int, c_void};

#[allow(dead_code)]
#[repr(C)]
pub(crate) struct NvBufSurfaceParams {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub color_format: c_int,
    pub layout: c_int,
    pub buffer_desc: u64,
    pub data_size: u32,
    pub data_ptr: *mut c_void,
}

#[allow(dead_code)]
#[repr(C)]
pub(crate) struct NvBufSurface {
    pub gpu_id: u32,
    pub batch_size: u32,
    pub num_filled: u32,
    pub is_contiguous: bool,
    pub mem_type: c_int,
    pub surface_list: *mut NvBufSurfaceParams,
}

/// Geometry and address of the first surface of a batch.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SurfaceView {
    pub gpu_id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub data_ptr: u64,
}

/// Read the first filled surface out of a mapped `memory:NVMM` buffer.
///
/// # Safety
///
/// `mapped` must be the mapped contents of an NVMM buffer produced by `nvvideoconvert`.
pub(crate) unsafe fn first_surface(mapped: &[u8]) -> Result<SurfaceView, String> {
    if mapped.len() < std::mem::size_of::<NvBufSurface>() {
        return Err(format!(
            "mapped NVMM buffer is {} bytes, too small for a surface header",
            mapped.len()
        ));
    }
    let batch = std::ptr::read_unaligned(mapped.as_ptr() as *const NvBufSurface);
    if batch.num_filled == 0 || batch.surface_list.is_null() {
        return Err("NVMM batch holds no filled surface".to_string());
    }
    let params = &*batch.surface_list;
    if params.data_ptr.is_null() {
        return Err("NVMM surface has a null data pointer".to_string());
    }
    Ok(SurfaceView {
        gpu_id: batch.gpu_id,
        width: params.width,
        height: params.height,
        pitch: params.pitch,
        data_ptr: params.data_ptr as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_first_surface_of_a_batch() {
        let mut pixels = [0u8; 16];
        let mut params = NvBufSurfaceParams {
            width: 2,
            height: 2,
            pitch: 8,
            color_format: 0,
            layout: 0,
            buffer_desc: 0,
            data_size: 16,
            data_ptr: pixels.as_mut_ptr() as *mut c_void,
        };
        let batch = NvBufSurface {
            gpu_id: 1,
            batch_size: 1,
            num_filled: 1,
            is_contiguous: false,
            mem_type: 0,
            surface_list: &mut params,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &batch as *const NvBufSurface as *const u8,
                std::mem::size_of::<NvBufSurface>(),
            )
        };
        let view = unsafe { first_surface(bytes) }.unwrap();
        assert_eq!(view.gpu_id, 1);
        assert_eq!((view.width, view.height, view.pitch), (2, 2, 8));
        assert_eq!(view.data_ptr, pixels.as_ptr() as u64);
    }

    #[test]
    fn rejects_short_or_empty_batches() {
        assert!(unsafe { first_surface(&[0u8; 4]) }.is_err());
        let empty = [0u8; std::mem::size_of::<NvBufSurface>()];
        assert!(unsafe { first_surface(&empty) }.is_err());
    }
}
