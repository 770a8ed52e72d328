//! CUDA FFI bindings.
//!
//! All `extern "C"` declarations live in [`cuda_runtime`], compiled only with
//! the `cuda` feature. Status codes and enumeration values are always
//! available so error reporting reads the same on every build.
//!
//! # Safety
//!
//! Every foreign function is unsafe. Callers must pass device ordinals below
//! `cudaGetDeviceCount` and handles created by the matching library.

#![allow(non_camel_case_types)]

#[cfg(feature = "cuda")]
pub mod cuda_runtime;

#[cfg(feature = "cuda")]
pub use cuda_runtime::*;

use std::os::raw::{c_int, c_uint};

// =============================================================================
// STATUS CODES
// =============================================================================

/// cudart status. 0 = success.
pub type cudaError_t = c_int;

/// cuBLAS status. 0 = success.
pub type cublasStatus_t = c_int;

/// cuRAND status. 0 = success.
pub type curandStatus_t = c_int;

pub const CUDA_SUCCESS: cudaError_t = 0;
pub const CUDA_ERROR_INVALID_VALUE: cudaError_t = 1;
pub const CUDA_ERROR_MEMORY_ALLOCATION: cudaError_t = 2;
pub const CUDA_ERROR_INVALID_DEVICE: cudaError_t = 101;
pub const CUDA_ERROR_NO_DEVICE: cudaError_t = 100;
pub const CUDA_ERROR_ILLEGAL_ADDRESS: cudaError_t = 700;
pub const CUDA_ERROR_LAUNCH_FAILURE: cudaError_t = 719;

pub const CUBLAS_STATUS_SUCCESS: cublasStatus_t = 0;
pub const CURAND_STATUS_SUCCESS: curandStatus_t = 0;

// =============================================================================
// ENUMERATION VALUES
// =============================================================================

pub const CUDA_MEMCPY_HOST_TO_HOST: c_int = 0;
pub const CUDA_MEMCPY_HOST_TO_DEVICE: c_int = 1;
pub const CUDA_MEMCPY_DEVICE_TO_HOST: c_int = 2;
pub const CUDA_MEMCPY_DEVICE_TO_DEVICE: c_int = 3;

/// `cudaStreamNonBlocking`.
pub const CUDA_STREAM_NON_BLOCKING: c_uint = 1;

pub const CUBLAS_POINTER_MODE_HOST: c_int = 0;
pub const CUBLAS_POINTER_MODE_DEVICE: c_int = 1;

/// `CURAND_RNG_PSEUDO_DEFAULT` (XORWOW).
pub const CURAND_RNG_PSEUDO_DEFAULT: c_int = 100;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Symbolic name for common cudart status codes.
///
/// # Example
///
/// ```
/// use opgraph_cuda::ffi::{cuda_error_name, CUDA_ERROR_ILLEGAL_ADDRESS};
/// assert_eq!(cuda_error_name(CUDA_ERROR_ILLEGAL_ADDRESS), "cudaErrorIllegalAddress");
/// ```
#[must_use]
pub fn cuda_error_name(code: cudaError_t) -> &'static str {
    match code {
        CUDA_SUCCESS => "cudaSuccess",
        CUDA_ERROR_INVALID_VALUE => "cudaErrorInvalidValue",
        CUDA_ERROR_MEMORY_ALLOCATION => "cudaErrorMemoryAllocation",
        CUDA_ERROR_NO_DEVICE => "cudaErrorNoDevice",
        CUDA_ERROR_INVALID_DEVICE => "cudaErrorInvalidDevice",
        CUDA_ERROR_ILLEGAL_ADDRESS => "cudaErrorIllegalAddress",
        CUDA_ERROR_LAUNCH_FAILURE => "cudaErrorLaunchFailure",
        _ => "cudaErrorUnknown",
    }
}

/// Symbolic name for cuBLAS status codes.
#[must_use]
pub fn cublas_status_name(status: cublasStatus_t) -> &'static str {
    match status {
        0 => "CUBLAS_STATUS_SUCCESS",
        1 => "CUBLAS_STATUS_NOT_INITIALIZED",
        3 => "CUBLAS_STATUS_ALLOC_FAILED",
        7 => "CUBLAS_STATUS_INVALID_VALUE",
        8 => "CUBLAS_STATUS_ARCH_MISMATCH",
        13 => "CUBLAS_STATUS_EXECUTION_FAILED",
        14 => "CUBLAS_STATUS_INTERNAL_ERROR",
        _ => "CUBLAS_STATUS_UNKNOWN",
    }
}

/// Symbolic name for cuRAND status codes.
#[must_use]
pub fn curand_status_name(status: curandStatus_t) -> &'static str {
    match status {
        0 => "CURAND_STATUS_SUCCESS",
        101 => "CURAND_STATUS_NOT_INITIALIZED",
        102 => "CURAND_STATUS_ALLOCATION_FAILED",
        103 => "CURAND_STATUS_TYPE_ERROR",
        104 => "CURAND_STATUS_OUT_OF_RANGE",
        201 => "CURAND_STATUS_LAUNCH_FAILURE",
        _ => "CURAND_STATUS_UNKNOWN",
    }
}
