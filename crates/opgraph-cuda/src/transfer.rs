//! Host-side transfers bound to the device that owns the memory.
//!
//! A host caller copying to or from device memory does not track which
//! device that memory lives on. These helpers look the owner up in the
//! memory pool, run the copy on a short-lived context for that device and
//! return once the copy is complete. [`CudaTensor::fetch`] and
//! [`CudaTensor::upload`] are built on them.
//!
//! [`CudaTensor::fetch`]: crate::tensor::CudaTensor::fetch
//! [`CudaTensor::upload`]: crate::tensor::CudaTensor::upload

use tracing::debug;

use crate::context::CudaContext;
use crate::device::{Device, Host};
use crate::error::{CudaError, CudaResult};
use crate::runtime;

/// Device that owns the pool block containing `ptr`.
///
/// # Errors
///
/// `CudaError::UnknownPointer` if `ptr` is not inside a live pool block.
pub fn owning_device(ptr: *const u8) -> CudaResult<usize> {
    runtime::memory_pool()
        .device_of(ptr)
        .ok_or(CudaError::UnknownPointer(ptr as usize))
}

/// Copy `nbytes` from device memory `src` to host memory `dst`, synchronously.
///
/// # Safety
///
/// `src` must be a pool-allocated device range and `dst` a host range, both
/// valid for `nbytes`.
pub unsafe fn copy_device_to_host(nbytes: usize, src: *const u8, dst: *mut u8) -> CudaResult<()> {
    if nbytes == 0 {
        return Ok(());
    }
    let device = owning_device(src)?;
    let ctx = CudaContext::new(device)?;
    ctx.copy::<Device, Host>(nbytes, src, dst)?;
    finish(&ctx, nbytes)
}

/// Copy `nbytes` from host memory `src` to device memory `dst`, synchronously.
///
/// # Safety
///
/// `src` must be a host range and `dst` a pool-allocated device range, both
/// valid for `nbytes`.
pub unsafe fn copy_host_to_device(nbytes: usize, src: *const u8, dst: *mut u8) -> CudaResult<()> {
    if nbytes == 0 {
        return Ok(());
    }
    let device = owning_device(dst)?;
    let ctx = CudaContext::new(device)?;
    ctx.copy::<Host, Device>(nbytes, src, dst)?;
    finish(&ctx, nbytes)
}

fn finish(ctx: &CudaContext, nbytes: usize) -> CudaResult<()> {
    if !ctx.synchronize() {
        return Err(CudaError::AsyncFault {
            device: ctx.device_id(),
            message: format!("transfer of {} bytes did not complete", nbytes),
        });
    }
    debug!(device = ctx.device_id(), nbytes, "transfer complete");
    Ok(())
}
