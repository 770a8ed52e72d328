//! Device API seam.
//!
//! [`DeviceBackend`] is the narrow set of runtime, BLAS and RNG entry points
//! the execution layer needs. Two implementations exist:
//!
//! - [`CudaBackend`] (feature `cuda`): cudart, cuBLAS and cuRAND over FFI
//! - [`SimulatedBackend`]: in-process devices backed by host memory, used on
//!   machines without a GPU and throughout the test suite
//!
//! All fallible calls return [`CudaResult`]; device failures are never
//! retried at this layer.

mod handles;
mod simulated;

#[cfg(feature = "cuda")]
mod cuda;

use std::any::Any;
use std::fmt;

pub use handles::{BlasHandle, RngHandle, Stream};
pub use simulated::{BlasInfo, RngInfo, SimulatedBackend};

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

use crate::error::CudaResult;

/// Direction of a memory copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemcpyKind {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Where BLAS scalar arguments (alpha, beta) are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerMode {
    Host,
    Device,
}

/// Asynchronous device error reported at a synchronization point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFault {
    pub code: i32,
    pub message: String,
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Runtime, BLAS and RNG entry points for one kind of device.
///
/// Device-scoped calls take the device explicitly; implementations make it
/// current themselves where the underlying API requires that.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Number of visible devices.
    fn device_count(&self) -> usize;

    /// Make `device` the active device for subsequent API calls.
    fn set_device(&self, device: usize) -> CudaResult<()>;

    /// Currently active device.
    fn current_device(&self) -> CudaResult<usize>;

    /// Create a non-blocking stream on `device`.
    fn create_stream(&self, device: usize) -> CudaResult<Stream>;

    /// Destroy a stream. Errors are logged, never raised.
    fn destroy_stream(&self, stream: Stream);

    /// Block until all work queued on `stream` has completed.
    fn stream_synchronize(&self, stream: Stream) -> CudaResult<()>;

    /// Return and clear the calling thread's pending asynchronous error.
    fn take_last_error(&self) -> Option<DeviceFault>;

    fn create_blas(&self, device: usize) -> CudaResult<BlasHandle>;
    fn blas_set_pointer_mode(&self, handle: BlasHandle, mode: PointerMode) -> CudaResult<()>;
    fn blas_set_stream(&self, handle: BlasHandle, stream: Stream) -> CudaResult<()>;
    fn destroy_blas(&self, handle: BlasHandle);

    /// `y = alpha * x + y` over `n` device floats, host-scalar `alpha`.
    ///
    /// # Safety
    ///
    /// `x` and `y` must address at least `n` floats of live device memory
    /// on the handle's device, valid until the handle's stream is synchronized.
    unsafe fn saxpy(
        &self,
        handle: BlasHandle,
        n: usize,
        alpha: f32,
        x: *const f32,
        y: *mut f32,
    ) -> CudaResult<()>;

    fn create_rng(&self, device: usize) -> CudaResult<RngHandle>;
    fn rng_set_seed(&self, handle: RngHandle, seed: u64) -> CudaResult<()>;
    fn rng_set_stream(&self, handle: RngHandle, stream: Stream) -> CudaResult<()>;
    fn destroy_rng(&self, handle: RngHandle);

    /// Fill `n` device floats with uniform values in `(0, 1]`.
    ///
    /// # Safety
    ///
    /// `dst` must address at least `n` floats of live device memory on the
    /// handle's device, valid until the handle's stream is synchronized.
    unsafe fn generate_uniform(&self, handle: RngHandle, dst: *mut f32, n: usize)
        -> CudaResult<()>;

    /// Allocate `nbytes` of device memory on `device`.
    fn malloc(&self, device: usize, nbytes: usize) -> CudaResult<*mut u8>;

    /// Free memory returned by [`DeviceBackend::malloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `malloc` on this backend and not be freed twice.
    unsafe fn free(&self, ptr: *mut u8) -> CudaResult<()>;

    /// Allocate `nbytes` of page-locked host memory.
    fn malloc_host(&self, nbytes: usize) -> CudaResult<*mut u8>;

    /// Free memory returned by [`DeviceBackend::malloc_host`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `malloc_host` on this backend and not be freed twice.
    unsafe fn free_host(&self, ptr: *mut u8) -> CudaResult<()>;

    /// Enqueue a copy of `nbytes` from `src` to `dst` on `stream`.
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for `nbytes` in the memory spaces named by
    /// `kind` and stay valid until `stream` is synchronized.
    unsafe fn memcpy_async(
        &self,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        kind: MemcpyKind,
        stream: Stream,
    ) -> CudaResult<()>;

    /// Downcasting hook for backend-specific inspection.
    fn as_any(&self) -> &dyn Any;
}
