//! Per-operation device execution context.
//!
//! A [`CudaContext`] is a cheap value naming a device and a random seed. It
//! owns no device objects itself: streams and library handles come from the
//! calling thread's resource registry, and memory from the process-wide
//! pool. Contexts are built per operator invocation and are bound to the
//! thread that built them.
//!
//! Dropping a context blocks until its stream drains. A device error seen
//! at that point is fatal; see [`SyncFailurePolicy`].

use std::marker::PhantomData;
use std::ptr;
use std::time::{SystemTime, UNIX_EPOCH};

use opgraph_core::{DeviceOption, DeviceType, Element, SyncFailurePolicy};
use tracing::{debug, error};

use crate::backend::{BlasHandle, RngHandle, Stream};
use crate::device::{memcpy_kind, Location, MemorySpace};
use crate::error::{CudaError, CudaResult};
use crate::{resources, runtime};

/// Seed used by contexts built from a bare device index.
pub const DEFAULT_RANDOM_SEED: u32 = 1701;

/// Execution context for one device on the current thread.
///
/// # Example
///
/// ```
/// use opgraph_cuda::CudaContext;
///
/// let ctx = CudaContext::new(0).unwrap();
/// let blas = ctx.blas_handle().unwrap();
/// assert_eq!(ctx.blas_handle().unwrap(), blas);
/// assert!(ctx.synchronize());
/// ```
#[derive(Debug)]
pub struct CudaContext {
    device: usize,
    random_seed: u32,
    sync_failure: SyncFailurePolicy,
    _thread: PhantomData<*const ()>,
}

impl CudaContext {
    /// Context on `device` with seed [`DEFAULT_RANDOM_SEED`].
    ///
    /// # Errors
    ///
    /// `CudaError::InvalidDevice` if `device` is not visible.
    pub fn new(device: usize) -> CudaResult<Self> {
        Self::with_seed(device, DEFAULT_RANDOM_SEED)
    }

    /// Context on the process default device.
    pub fn on_default_device() -> CudaResult<Self> {
        Self::new(runtime::default_device())
    }

    /// Context on `device` with an explicit RNG seed.
    pub fn with_seed(device: usize, random_seed: u32) -> CudaResult<Self> {
        let count = runtime::device_count();
        if device >= count {
            return Err(CudaError::InvalidDevice { device, count });
        }
        Ok(Self {
            device,
            random_seed,
            sync_failure: runtime::sync_failure_policy(),
            _thread: PhantomData,
        })
    }

    /// Context for an operator placed by `option`.
    ///
    /// An unset device means the process default device; an unset seed is
    /// derived from the wall clock.
    ///
    /// # Errors
    ///
    /// - `CudaError::InvalidDeviceOption` if `option` is not a CUDA placement
    /// - `CudaError::InvalidDevice` if the named device is not visible
    pub fn from_device_option(option: &DeviceOption) -> CudaResult<Self> {
        if option.device_type != DeviceType::Cuda {
            return Err(CudaError::InvalidDeviceOption(format!(
                "expected a CUDA device option, got {:?}",
                option.device_type
            )));
        }
        let device = option
            .cuda_gpu_id
            .unwrap_or_else(runtime::default_device);
        let seed = option.random_seed.unwrap_or_else(time_seed);
        Self::with_seed(device, seed)
    }

    /// Override the process-wide policy for this context's drop.
    #[must_use]
    pub fn with_sync_failure_policy(mut self, policy: SyncFailurePolicy) -> Self {
        self.sync_failure = policy;
        self
    }

    #[inline]
    pub fn device_id(&self) -> usize {
        self.device
    }

    #[inline]
    pub fn random_seed(&self) -> u32 {
        self.random_seed
    }

    #[inline]
    pub fn sync_failure_policy(&self) -> SyncFailurePolicy {
        self.sync_failure
    }

    /// Make this context's device the active device.
    pub fn select(&self) -> CudaResult<()> {
        runtime::backend().set_device(self.device)
    }

    /// Block until this thread's stream for the device drains.
    ///
    /// Returns `false` and logs when the device reports an error; the error
    /// is consumed.
    pub fn synchronize(&self) -> bool {
        let backend = runtime::backend();
        let stream = match resources::stream(self.device) {
            Ok(stream) => stream,
            Err(e) => {
                error!(device = self.device, error = %e, "Encountered CUDA error: no stream");
                return false;
            }
        };
        let synced = backend.stream_synchronize(stream);
        let fault = backend.take_last_error();
        match (synced, fault) {
            (Ok(()), None) => true,
            (_, Some(fault)) => {
                error!(device = self.device, error = %fault, "Encountered CUDA error");
                false
            }
            (Err(e), None) => {
                error!(device = self.device, error = %e, "Encountered CUDA error");
                false
            }
        }
    }

    /// This thread's stream for the device.
    pub fn stream(&self) -> CudaResult<Stream> {
        resources::stream(self.device)
    }

    /// This thread's BLAS handle for the device, host pointer mode, bound
    /// to [`CudaContext::stream`].
    pub fn blas_handle(&self) -> CudaResult<BlasHandle> {
        resources::blas_handle(self.device)
    }

    /// This thread's RNG handle for the device, bound to
    /// [`CudaContext::stream`]. The seed is fixed by whichever context
    /// touches the handle first on this thread: its seed plus the device index.
    pub fn rng_handle(&self) -> CudaResult<RngHandle> {
        resources::rng_handle(self.device, u64::from(self.random_seed))
    }

    /// Allocate `nbytes` of device memory on this context's device.
    ///
    /// The caller owns the block and must return it through
    /// [`CudaContext::release`] or the memory pool.
    pub fn allocate(&self, nbytes: usize) -> CudaResult<*mut u8> {
        runtime::memory_pool().allocate(self.device, nbytes)
    }

    /// Return a block obtained from [`CudaContext::allocate`].
    pub fn release(&self, ptr: *mut u8) -> CudaResult<()> {
        runtime::memory_pool().release(ptr)
    }

    /// Copy `nbytes` from `src` in `Src` memory to `dst` in `Dst` memory.
    ///
    /// Copies touching device memory are enqueued on this context's stream
    /// and complete by the next [`CudaContext::synchronize`]. Host to host
    /// copies complete before returning.
    ///
    /// # Safety
    ///
    /// `src` and `dst` must be valid for `nbytes` in the named memory spaces
    /// and stay valid, with `src` unmodified, until the stream is
    /// synchronized.
    pub unsafe fn copy<Src: MemorySpace, Dst: MemorySpace>(
        &self,
        nbytes: usize,
        src: *const u8,
        dst: *mut u8,
    ) -> CudaResult<()> {
        if nbytes == 0 {
            return Ok(());
        }
        let kind = memcpy_kind(Src::LOCATION, Dst::LOCATION);
        if Src::LOCATION == Location::Host && Dst::LOCATION == Location::Host {
            ptr::copy(src, dst, nbytes);
            return Ok(());
        }
        let stream = self.stream()?;
        debug!(device = self.device, nbytes, kind = ?kind, "enqueue copy");
        runtime::backend().memcpy_async(dst, src, nbytes, kind, stream)
    }

    /// Typed [`CudaContext::copy`] of `n` elements.
    ///
    /// # Safety
    ///
    /// As for [`CudaContext::copy`], for `n * size_of::<T>()` bytes.
    pub unsafe fn copy_items<T: Element, Src: MemorySpace, Dst: MemorySpace>(
        &self,
        n: usize,
        src: *const T,
        dst: *mut T,
    ) -> CudaResult<()> {
        self.copy::<Src, Dst>(n * std::mem::size_of::<T>(), src.cast(), dst.cast())
    }
}

fn time_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(DEFAULT_RANDOM_SEED)
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        if self.synchronize() {
            return;
        }
        match self.sync_failure {
            SyncFailurePolicy::Abort => {
                error!(
                    device = self.device,
                    "device synchronization failed while releasing context, aborting"
                );
                std::process::abort();
            }
            SyncFailurePolicy::Panic => {
                if std::thread::panicking() {
                    error!(
                        device = self.device,
                        "device synchronization failed while unwinding"
                    );
                    return;
                }
                panic!(
                    "device synchronization failed while releasing context on device {}",
                    self.device
                );
            }
        }
    }
}
