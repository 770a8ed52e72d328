//! CUDA runtime, cuBLAS and cuRAND FFI bindings.
//!
//! Only the entry points the execution context needs are declared. All of
//! them are blocking or enqueue-only host calls; none is safe to call with
//! a device ordinal that was not validated against `cudaGetDeviceCount`.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
use std::os::raw::{c_char, c_float, c_int, c_uint, c_ulonglong};

use super::{cudaError_t, cublasStatus_t, curandStatus_t};

// =============================================================================
// TYPE ALIASES
// =============================================================================

/// Stream handle (opaque pointer).
pub type cudaStream_t = *mut c_void;

/// cuBLAS library context (opaque pointer).
pub type cublasHandle_t = *mut c_void;

/// cuRAND generator (opaque pointer).
pub type curandGenerator_t = *mut c_void;

/// `cudaMemcpyKind` enumeration value.
pub type cudaMemcpyKind = c_int;

/// `cublasPointerMode_t` enumeration value.
pub type cublasPointerMode_t = c_int;

/// `curandRngType_t` enumeration value.
pub type curandRngType_t = c_int;

// =============================================================================
// FFI DECLARATIONS
// =============================================================================

#[link(name = "cudart")]
extern "C" {
    pub fn cudaGetDeviceCount(count: *mut c_int) -> cudaError_t;
    pub fn cudaSetDevice(device: c_int) -> cudaError_t;
    pub fn cudaGetDevice(device: *mut c_int) -> cudaError_t;

    /// Create a stream; `flags` is `CUDA_STREAM_NON_BLOCKING` here so the
    /// stream never serializes against the legacy default stream.
    pub fn cudaStreamCreateWithFlags(stream: *mut cudaStream_t, flags: c_uint) -> cudaError_t;
    pub fn cudaStreamDestroy(stream: cudaStream_t) -> cudaError_t;
    pub fn cudaStreamSynchronize(stream: cudaStream_t) -> cudaError_t;

    /// Return and reset the calling thread's last error.
    pub fn cudaGetLastError() -> cudaError_t;
    pub fn cudaGetErrorString(error: cudaError_t) -> *const c_char;

    pub fn cudaMalloc(ptr: *mut *mut c_void, size: usize) -> cudaError_t;
    pub fn cudaFree(ptr: *mut c_void) -> cudaError_t;
    pub fn cudaMallocHost(ptr: *mut *mut c_void, size: usize) -> cudaError_t;
    pub fn cudaFreeHost(ptr: *mut c_void) -> cudaError_t;

    pub fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: cudaMemcpyKind,
        stream: cudaStream_t,
    ) -> cudaError_t;
}

#[link(name = "cublas")]
extern "C" {
    pub fn cublasCreate_v2(handle: *mut cublasHandle_t) -> cublasStatus_t;
    pub fn cublasDestroy_v2(handle: cublasHandle_t) -> cublasStatus_t;
    pub fn cublasSetPointerMode_v2(
        handle: cublasHandle_t,
        mode: cublasPointerMode_t,
    ) -> cublasStatus_t;
    pub fn cublasSetStream_v2(handle: cublasHandle_t, stream: cudaStream_t) -> cublasStatus_t;

    /// `y = alpha * x + y`. `alpha` is read through the handle's pointer mode.
    pub fn cublasSaxpy_v2(
        handle: cublasHandle_t,
        n: c_int,
        alpha: *const c_float,
        x: *const c_float,
        incx: c_int,
        y: *mut c_float,
        incy: c_int,
    ) -> cublasStatus_t;
}

#[link(name = "curand")]
extern "C" {
    pub fn curandCreateGenerator(
        generator: *mut curandGenerator_t,
        rng_type: curandRngType_t,
    ) -> curandStatus_t;
    pub fn curandDestroyGenerator(generator: curandGenerator_t) -> curandStatus_t;
    pub fn curandSetPseudoRandomGeneratorSeed(
        generator: curandGenerator_t,
        seed: c_ulonglong,
    ) -> curandStatus_t;
    pub fn curandSetStream(generator: curandGenerator_t, stream: cudaStream_t) -> curandStatus_t;

    /// Uniform floats in `(0, 1]`.
    pub fn curandGenerateUniform(
        generator: curandGenerator_t,
        output: *mut c_float,
        num: usize,
    ) -> curandStatus_t;
}
