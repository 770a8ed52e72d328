//! cudart / cuBLAS / cuRAND backend.

use std::any::Any;
use std::ffi::{c_void, CStr};
use std::os::raw::c_int;
use std::ptr;

use opgraph_core::config::MAX_DEVICES;
use tracing::{info, warn};

use super::{BlasHandle, DeviceBackend, DeviceFault, MemcpyKind, PointerMode, RngHandle, Stream};
use crate::error::{CudaError, CudaResult};
use crate::ffi::{self, cudaError_t};

/// Backend over the CUDA runtime API.
///
/// Stream, BLAS and RNG handles carry the library's own pointers as raw
/// values.
#[derive(Debug)]
pub struct CudaBackend {
    device_count: usize,
}

impl CudaBackend {
    /// Probe the runtime for visible devices.
    ///
    /// # Errors
    ///
    /// - `CudaError::Api` if the runtime cannot be queried
    /// - `CudaError::NoDevice` if zero devices are visible
    ///
    /// Only the first [`MAX_DEVICES`] devices are used.
    pub fn new() -> CudaResult<Self> {
        let mut count: c_int = 0;
        // SAFETY: count is a valid out-pointer.
        check_cuda("cudaGetDeviceCount", unsafe {
            ffi::cudaGetDeviceCount(&mut count)
        })?;
        if count <= 0 {
            return Err(CudaError::NoDevice);
        }
        let mut device_count = count as usize;
        if device_count > MAX_DEVICES {
            warn!(
                device_count,
                max = MAX_DEVICES,
                "more devices visible than supported, using the first {}",
                MAX_DEVICES
            );
            device_count = MAX_DEVICES;
        }
        info!(device_count, "CUDA runtime backend initialized");
        Ok(Self { device_count })
    }

    fn check_device(&self, device: usize) -> CudaResult<()> {
        if device >= self.device_count {
            return Err(CudaError::InvalidDevice {
                device,
                count: self.device_count,
            });
        }
        Ok(())
    }

    /// Run `call` with `device` active, then restore the previously active device.
    fn on_device<T>(&self, device: usize, call: impl FnOnce() -> T) -> CudaResult<T> {
        let previous = self.current_device()?;
        if previous != device {
            self.set_device(device)?;
        }
        let result = call();
        if previous != device {
            if let Err(e) = self.set_device(previous) {
                warn!(device = previous, error = %e, "failed to restore active device");
            }
        }
        Ok(result)
    }
}

fn error_string(code: cudaError_t) -> String {
    // SAFETY: cudaGetErrorString returns a static NUL-terminated string for
    // every code, including unknown ones.
    let raw = unsafe { ffi::cudaGetErrorString(code) };
    if raw.is_null() {
        return ffi::cuda_error_name(code).to_string();
    }
    unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned()
}

fn check_cuda(call: &'static str, code: cudaError_t) -> CudaResult<()> {
    if code == ffi::CUDA_SUCCESS {
        return Ok(());
    }
    if code == ffi::CUDA_ERROR_NO_DEVICE {
        return Err(CudaError::NoDevice);
    }
    Err(CudaError::Api {
        call,
        code,
        message: error_string(code),
    })
}

fn check_cublas(call: &'static str, status: ffi::cublasStatus_t) -> CudaResult<()> {
    if status == ffi::CUBLAS_STATUS_SUCCESS {
        return Ok(());
    }
    Err(CudaError::Api {
        call,
        code: status,
        message: ffi::cublas_status_name(status).to_string(),
    })
}

fn check_curand(call: &'static str, status: ffi::curandStatus_t) -> CudaResult<()> {
    if status == ffi::CURAND_STATUS_SUCCESS {
        return Ok(());
    }
    Err(CudaError::Api {
        call,
        code: status,
        message: ffi::curand_status_name(status).to_string(),
    })
}

fn memcpy_kind(kind: MemcpyKind) -> c_int {
    match kind {
        MemcpyKind::HostToHost => ffi::CUDA_MEMCPY_HOST_TO_HOST,
        MemcpyKind::HostToDevice => ffi::CUDA_MEMCPY_HOST_TO_DEVICE,
        MemcpyKind::DeviceToHost => ffi::CUDA_MEMCPY_DEVICE_TO_HOST,
        MemcpyKind::DeviceToDevice => ffi::CUDA_MEMCPY_DEVICE_TO_DEVICE,
    }
}

fn as_ptr(raw: usize) -> *mut c_void {
    raw as *mut c_void
}

impl DeviceBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> usize {
        self.device_count
    }

    fn set_device(&self, device: usize) -> CudaResult<()> {
        self.check_device(device)?;
        // SAFETY: ordinal validated above.
        check_cuda("cudaSetDevice", unsafe { ffi::cudaSetDevice(device as c_int) })
    }

    fn current_device(&self) -> CudaResult<usize> {
        let mut device: c_int = 0;
        // SAFETY: device is a valid out-pointer.
        check_cuda("cudaGetDevice", unsafe { ffi::cudaGetDevice(&mut device) })?;
        Ok(device as usize)
    }

    fn create_stream(&self, device: usize) -> CudaResult<Stream> {
        self.set_device(device)?;
        let mut stream: ffi::cudaStream_t = ptr::null_mut();
        // SAFETY: stream is a valid out-pointer; the device is current.
        check_cuda("cudaStreamCreateWithFlags", unsafe {
            ffi::cudaStreamCreateWithFlags(&mut stream, ffi::CUDA_STREAM_NON_BLOCKING)
        })?;
        Ok(Stream::from_raw(stream as usize))
    }

    fn destroy_stream(&self, stream: Stream) {
        // SAFETY: stream was created by cudaStreamCreateWithFlags.
        let code = unsafe { ffi::cudaStreamDestroy(as_ptr(stream.raw())) };
        if code != ffi::CUDA_SUCCESS {
            warn!(stream = ?stream, error = %error_string(code), "cudaStreamDestroy failed");
        }
    }

    fn stream_synchronize(&self, stream: Stream) -> CudaResult<()> {
        // SAFETY: stream was created by cudaStreamCreateWithFlags.
        check_cuda("cudaStreamSynchronize", unsafe {
            ffi::cudaStreamSynchronize(as_ptr(stream.raw()))
        })
    }

    fn take_last_error(&self) -> Option<DeviceFault> {
        // SAFETY: no arguments; resets the thread's error state.
        let code = unsafe { ffi::cudaGetLastError() };
        (code != ffi::CUDA_SUCCESS).then(|| DeviceFault {
            code,
            message: error_string(code),
        })
    }

    fn create_blas(&self, device: usize) -> CudaResult<BlasHandle> {
        self.set_device(device)?;
        let mut handle: ffi::cublasHandle_t = ptr::null_mut();
        // SAFETY: handle is a valid out-pointer; the device is current.
        check_cublas("cublasCreate", unsafe { ffi::cublasCreate_v2(&mut handle) })?;
        Ok(BlasHandle::from_raw(handle as usize))
    }

    fn blas_set_pointer_mode(&self, handle: BlasHandle, mode: PointerMode) -> CudaResult<()> {
        let mode = match mode {
            PointerMode::Host => ffi::CUBLAS_POINTER_MODE_HOST,
            PointerMode::Device => ffi::CUBLAS_POINTER_MODE_DEVICE,
        };
        // SAFETY: handle was created by cublasCreate.
        check_cublas("cublasSetPointerMode", unsafe {
            ffi::cublasSetPointerMode_v2(as_ptr(handle.raw()), mode)
        })
    }

    fn blas_set_stream(&self, handle: BlasHandle, stream: Stream) -> CudaResult<()> {
        // SAFETY: both handles were created by their libraries.
        check_cublas("cublasSetStream", unsafe {
            ffi::cublasSetStream_v2(as_ptr(handle.raw()), as_ptr(stream.raw()))
        })
    }

    fn destroy_blas(&self, handle: BlasHandle) {
        // SAFETY: handle was created by cublasCreate.
        let status = unsafe { ffi::cublasDestroy_v2(as_ptr(handle.raw())) };
        if status != ffi::CUBLAS_STATUS_SUCCESS {
            warn!(handle = ?handle, status = ffi::cublas_status_name(status), "cublasDestroy failed");
        }
    }

    unsafe fn saxpy(
        &self,
        handle: BlasHandle,
        n: usize,
        alpha: f32,
        x: *const f32,
        y: *mut f32,
    ) -> CudaResult<()> {
        let n = c_int::try_from(n).map_err(|_| CudaError::Api {
            call: "cublasSaxpy",
            code: ffi::CUDA_ERROR_INVALID_VALUE,
            message: format!("element count {} exceeds i32::MAX", n),
        })?;
        check_cublas(
            "cublasSaxpy",
            ffi::cublasSaxpy_v2(as_ptr(handle.raw()), n, &alpha, x, 1, y, 1),
        )
    }

    fn create_rng(&self, device: usize) -> CudaResult<RngHandle> {
        self.set_device(device)?;
        let mut generator: ffi::curandGenerator_t = ptr::null_mut();
        // SAFETY: generator is a valid out-pointer; the device is current.
        check_curand("curandCreateGenerator", unsafe {
            ffi::curandCreateGenerator(&mut generator, ffi::CURAND_RNG_PSEUDO_DEFAULT)
        })?;
        Ok(RngHandle::from_raw(generator as usize))
    }

    fn rng_set_seed(&self, handle: RngHandle, seed: u64) -> CudaResult<()> {
        // SAFETY: handle was created by curandCreateGenerator.
        check_curand("curandSetPseudoRandomGeneratorSeed", unsafe {
            ffi::curandSetPseudoRandomGeneratorSeed(as_ptr(handle.raw()), seed)
        })
    }

    fn rng_set_stream(&self, handle: RngHandle, stream: Stream) -> CudaResult<()> {
        // SAFETY: both handles were created by their libraries.
        check_curand("curandSetStream", unsafe {
            ffi::curandSetStream(as_ptr(handle.raw()), as_ptr(stream.raw()))
        })
    }

    fn destroy_rng(&self, handle: RngHandle) {
        // SAFETY: handle was created by curandCreateGenerator.
        let status = unsafe { ffi::curandDestroyGenerator(as_ptr(handle.raw())) };
        if status != ffi::CURAND_STATUS_SUCCESS {
            warn!(handle = ?handle, status = ffi::curand_status_name(status), "curandDestroyGenerator failed");
        }
    }

    unsafe fn generate_uniform(
        &self,
        handle: RngHandle,
        dst: *mut f32,
        n: usize,
    ) -> CudaResult<()> {
        check_curand(
            "curandGenerateUniform",
            ffi::curandGenerateUniform(as_ptr(handle.raw()), dst, n),
        )
    }

    fn malloc(&self, device: usize, nbytes: usize) -> CudaResult<*mut u8> {
        let mut ptr: *mut c_void = ptr::null_mut();
        // SAFETY: ptr is a valid out-pointer; the device is current for the call.
        let code = self.on_device(device, || unsafe { ffi::cudaMalloc(&mut ptr, nbytes) })?;
        if code == ffi::CUDA_ERROR_MEMORY_ALLOCATION {
            // Reset the error state so the next synchronize does not report it.
            // SAFETY: no arguments.
            unsafe { ffi::cudaGetLastError() };
            return Err(CudaError::OutOfMemory {
                device,
                requested: nbytes,
                available: 0,
            });
        }
        check_cuda("cudaMalloc", code)?;
        Ok(ptr.cast())
    }

    unsafe fn free(&self, ptr: *mut u8) -> CudaResult<()> {
        check_cuda("cudaFree", ffi::cudaFree(ptr.cast()))
    }

    fn malloc_host(&self, nbytes: usize) -> CudaResult<*mut u8> {
        let mut ptr: *mut c_void = ptr::null_mut();
        // SAFETY: ptr is a valid out-pointer.
        check_cuda("cudaMallocHost", unsafe {
            ffi::cudaMallocHost(&mut ptr, nbytes)
        })?;
        Ok(ptr.cast())
    }

    unsafe fn free_host(&self, ptr: *mut u8) -> CudaResult<()> {
        check_cuda("cudaFreeHost", ffi::cudaFreeHost(ptr.cast()))
    }

    unsafe fn memcpy_async(
        &self,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        kind: MemcpyKind,
        stream: Stream,
    ) -> CudaResult<()> {
        check_cuda(
            "cudaMemcpyAsync",
            ffi::cudaMemcpyAsync(
                dst.cast(),
                src.cast(),
                nbytes,
                memcpy_kind(kind),
                as_ptr(stream.raw()),
            ),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
